use std::io::SeekFrom;

use async_stream::stream;
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::{self, if_match_get_tokens};
use crate::errors::DavError;
use crate::fs::OpenOptions;
use crate::util::{dav_method, systemtime_to_httpdate, DavMethod};
use crate::DavResult;

pub(crate) const READ_BUF_SIZE: usize = 16384;

// A single "bytes=start-end" range; multi-range requests are served in
// full instead.
fn parse_range(s: &str, len: u64) -> Option<(u64, u64)> {
    let spec = s.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = match (start.trim(), end.trim()) {
        ("", "") => return None,
        // suffix form: the last N bytes.
        ("", n) => {
            let n = n.parse::<u64>().ok()?;
            (len.saturating_sub(n), len.saturating_sub(1))
        }
        (s, "") => (s.parse::<u64>().ok()?, len.saturating_sub(1)),
        (s, e) => (s.parse::<u64>().ok()?, e.parse::<u64>().ok()?),
    };
    if start > end || start >= len {
        return None;
    }
    Some((start, end.min(len.saturating_sub(1))))
}

impl crate::DavHandler {
    pub(crate) async fn handle_get(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let head = matches!(dav_method(req.method()), Ok(DavMethod::Head));
        let mut path = self.path(req);

        let mut res = Response::new(Body::empty());
        let meta = self.fs.metadata(&path).await?;
        let meta = self.fixpath(&mut res, &mut path, meta);
        if meta.is_dir() {
            // no collection listings here; webdav clients use PROPFIND.
            return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
        }

        // conditionals can finish the request before we open anything.
        if_match_get_tokens(
            req.headers(),
            Some(&*meta),
            &*self.fs,
            self.ls.as_deref(),
            &self.prefix,
            &path,
        )
        .await?;
        let method = dav_method(req.method()).unwrap_or(DavMethod::Get);
        if let Some(status) = conditional::http_conditionals(req.headers(), method, Some(&*meta)) {
            if let Some(etag) = conditional::quoted_etag(&*meta) {
                res.headers_mut().typed_insert(etag);
            }
            *res.status_mut() = status;
            return Ok(res);
        }

        let len = meta.len();
        let mut start = 0u64;
        let mut count = len;

        // a Range only applies when If-Range still matches.
        let range = req
            .headers()
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_range(v, len));
        let if_range_ok = match req.headers().get("if-range").and_then(|v| v.to_str().ok()) {
            None => true,
            Some(sent) => match meta.etag() {
                Some(cur) => sent.trim().trim_start_matches("W/") == format!("\"{cur}\""),
                None => false,
            },
        };
        if let (Some((s, e)), true) = (range, if_range_ok) {
            start = s;
            count = e - s + 1;
        }

        {
            let h = res.headers_mut();
            if let Some(etag) = conditional::quoted_etag(&*meta) {
                h.typed_insert(etag);
            }
            if let Ok(modified) = meta.modified() {
                h.insert(
                    "last-modified",
                    systemtime_to_httpdate(modified).parse().unwrap(),
                );
            }
            h.insert(
                "content-type",
                path.get_mime_type_str().parse().unwrap(),
            );
            h.typed_insert(headers::ContentLength(count));
            h.typed_insert(headers::AcceptRanges::bytes());
            if count != len {
                h.insert(
                    "content-range",
                    format!("bytes {}-{}/{}", start, start + count - 1, len)
                        .parse()
                        .unwrap(),
                );
            }
        }
        if count != len {
            *res.status_mut() = StatusCode::PARTIAL_CONTENT;
        }

        if head {
            return Ok(res);
        }

        let mut file = self.fs.open(&path, OpenOptions::read()).await?;
        if start > 0 {
            // backend cannot seek: forget the range, serve everything.
            if file.seek(SeekFrom::Start(start)).await.is_err() {
                count = len;
                *res.status_mut() = StatusCode::OK;
                res.headers_mut().remove("content-range");
                res.headers_mut().typed_insert(headers::ContentLength(len));
            }
        }

        let read_buf_size = self.read_buf_size;
        *res.body_mut() = Body::stream(stream! {
            let mut todo = count;
            while todo > 0 {
                let chunk = (todo as usize).min(read_buf_size);
                match file.read_bytes(chunk).await {
                    Ok(buf) if buf.is_empty() => break,
                    Ok(buf) => {
                        todo -= buf.len() as u64;
                        yield Ok(buf);
                    }
                    Err(e) => {
                        yield Err(std::io::Error::from(DavError::FsError(e)));
                        break;
                    }
                }
            }
        });

        Ok(res)
    }
}
