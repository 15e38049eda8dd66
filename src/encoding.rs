//! Content codings: `Accept-Encoding` negotiation, request body
//! decoding and response body compression.
use std::io;

use async_compression::tokio::bufread::{
    BrotliDecoder, BrotliEncoder, GzipDecoder, GzipEncoder, ZlibDecoder, ZlibEncoder,
};
use http::header::{HeaderMap, HeaderValue};
use http::Response;
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::body::Body;
use crate::errors::DavError;
use crate::DavResult;

/// Content codings we can apply or undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentCoding {
    Gzip,
    Deflate,
    Brotli,
    Identity,
}

impl ContentCoding {
    // "x-gzip" is the legacy alias from RFC 7230.
    fn parse(s: &str) -> Option<ContentCoding> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("gzip") || s.eq_ignore_ascii_case("x-gzip") {
            Some(ContentCoding::Gzip)
        } else if s.eq_ignore_ascii_case("deflate") {
            Some(ContentCoding::Deflate)
        } else if s.eq_ignore_ascii_case("br") {
            Some(ContentCoding::Brotli)
        } else if s.eq_ignore_ascii_case("identity") {
            Some(ContentCoding::Identity)
        } else {
            None
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            ContentCoding::Gzip => "gzip",
            ContentCoding::Deflate => "deflate",
            ContentCoding::Brotli => "br",
            ContentCoding::Identity => "identity",
        }
    }
}

/// The coding of the request body, from `Content-Encoding`.
///
/// Unknown codings are refused; the caller maps that to 415.
pub(crate) fn request_coding(headers: &HeaderMap) -> DavResult<ContentCoding> {
    let mut codings = headers
        .get_all("content-encoding")
        .iter()
        .flat_map(|v| v.to_str().unwrap_or("?").split(','))
        .filter(|s| !s.trim().is_empty());
    let coding = match codings.next() {
        None => return Ok(ContentCoding::Identity),
        Some(s) => ContentCoding::parse(s).ok_or(DavError::UnsupportedMediaType)?,
    };
    if codings.next().is_some() {
        // stacked codings, not supported.
        return Err(DavError::UnsupportedMediaType);
    }
    Ok(coding)
}

// One element of an Accept-Encoding header.
fn parse_accept_item(item: &str) -> Option<(String, f32)> {
    let mut parts = item.split(';');
    let name = parts.next()?.trim().to_ascii_lowercase();
    if name.is_empty() {
        return None;
    }
    let mut q = 1.0f32;
    for p in parts {
        let p = p.trim();
        if let Some(v) = p.strip_prefix("q=").or_else(|| p.strip_prefix("Q=")) {
            q = v.trim().parse::<f32>().unwrap_or(0.0);
        }
    }
    Some((name, q))
}

/// Choose the response coding from `Accept-Encoding`.
///
/// `*` stands for any supported coding not named explicitly, preferring
/// gzip. Identity is implicitly acceptable unless ruled out; if nothing
/// is left the request fails with `UnsupportedEncoding`.
pub(crate) fn accepted_coding(headers: &HeaderMap) -> DavResult<ContentCoding> {
    if !headers.contains_key("accept-encoding") {
        return Ok(ContentCoding::Identity);
    }
    let mut prefs: Vec<(String, f32)> = Vec::new();
    for value in headers.get_all("accept-encoding") {
        let Ok(s) = value.to_str() else {
            return Err(DavError::UnsupportedEncoding);
        };
        prefs.extend(s.split(',').filter_map(parse_accept_item));
    }

    let named_q = |coding: ContentCoding| {
        prefs
            .iter()
            .find(|(name, _)| ContentCoding::parse(name) == Some(coding))
            .map(|&(_, q)| q)
    };
    let star_q = prefs
        .iter()
        .find(|(name, _)| name == "*")
        .map(|&(_, q)| q);

    // Order is the server preference among equal q-values.
    let candidates = [
        ContentCoding::Gzip,
        ContentCoding::Brotli,
        ContentCoding::Deflate,
        ContentCoding::Identity,
    ];
    let mut best: Option<(ContentCoding, f32)> = None;
    for coding in candidates {
        let q = match named_q(coding) {
            Some(q) => q,
            // identity is acceptable by default, with the lowest priority.
            None => match star_q {
                Some(q) => q,
                None if coding == ContentCoding::Identity => f32::MIN_POSITIVE,
                None => 0.0,
            },
        };
        if q > 0.0 && best.map_or(true, |(_, bq)| q > bq) {
            best = Some((coding, q));
        }
    }
    match best {
        Some((coding, _)) => Ok(coding),
        None => Err(DavError::UnsupportedEncoding),
    }
}

/// Undo the request body coding on a fully buffered body.
pub(crate) async fn decode_bytes(data: Vec<u8>, coding: ContentCoding) -> DavResult<Vec<u8>> {
    let mut out = Vec::new();
    let res = match coding {
        ContentCoding::Identity => return Ok(data),
        ContentCoding::Gzip => GzipDecoder::new(&data[..]).read_to_end(&mut out).await,
        ContentCoding::Deflate => ZlibDecoder::new(&data[..]).read_to_end(&mut out).await,
        ContentCoding::Brotli => BrotliDecoder::new(&data[..]).read_to_end(&mut out).await,
    };
    match res {
        Ok(_) => Ok(out),
        Err(_) => Err(DavError::XmlReadError),
    }
}

/// Wrap a response body in a compressor.
fn compress_body(body: Body, coding: ContentCoding) -> Body {
    let reader = StreamReader::new(body);
    match coding {
        ContentCoding::Identity => unreachable!(),
        ContentCoding::Gzip => Body::stream(ReaderStream::new(GzipEncoder::new(reader))),
        ContentCoding::Deflate => Body::stream(ReaderStream::new(ZlibEncoder::new(reader))),
        ContentCoding::Brotli => Body::stream(ReaderStream::new(BrotliEncoder::new(reader))),
    }
}

/// Apply the negotiated coding to a finished response.
///
/// Skipped when compression is off, when the response asked for
/// `no-transform`, or when identity won the negotiation. `Vary` is set
/// whenever compression was considered at all.
pub(crate) fn encode_response(res: &mut Response<Body>, coding: ContentCoding, enabled: bool) {
    if !enabled {
        return;
    }
    res.headers_mut()
        .append("vary", HeaderValue::from_static("Accept-Encoding"));

    if coding == ContentCoding::Identity {
        return;
    }
    let no_transform = res
        .headers()
        .get("cache-control")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("no-transform"))
        .unwrap_or(false);
    if no_transform || res.headers().contains_key("content-encoding") {
        return;
    }
    // 206 is excluded: ranges are computed on the identity form.
    if !res.status().is_success()
        || res.status() == http::StatusCode::NO_CONTENT
        || res.status() == http::StatusCode::PARTIAL_CONTENT
    {
        return;
    }
    if res.body().is_empty() {
        return;
    }

    res.headers_mut().remove("content-length");
    res.headers_mut()
        .insert("content-encoding", HeaderValue::from_static(coding.name()));
    let body = std::mem::replace(res.body_mut(), Body::empty());
    *res.body_mut() = compress_body(body, coding);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(value: &str) -> HeaderMap {
        let mut hm = HeaderMap::new();
        hm.insert("accept-encoding", value.parse().unwrap());
        hm
    }

    #[test]
    fn test_no_header_is_identity() {
        assert_eq!(
            accepted_coding(&HeaderMap::new()).unwrap(),
            ContentCoding::Identity
        );
    }

    #[test]
    fn test_qvalues() {
        assert_eq!(
            accepted_coding(&accept("deflate;q=0.5, br;q=0.8")).unwrap(),
            ContentCoding::Brotli
        );
        assert_eq!(
            accepted_coding(&accept("gzip, identity;q=0.1")).unwrap(),
            ContentCoding::Gzip
        );
        assert_eq!(
            accepted_coding(&accept("x-gzip")).unwrap(),
            ContentCoding::Gzip
        );
    }

    #[test]
    fn test_star_picks_unlisted() {
        // gzip is ruled out, * covers the rest.
        assert_eq!(
            accepted_coding(&accept("gzip;q=0, *")).unwrap(),
            ContentCoding::Brotli
        );
    }

    #[test]
    fn test_nothing_acceptable() {
        assert!(accepted_coding(&accept("identity;q=0, *;q=0")).is_err());
        assert_eq!(
            accepted_coding(&accept("zstd")).unwrap(),
            ContentCoding::Identity
        );
    }

    #[test]
    fn test_request_coding() {
        let mut hm = HeaderMap::new();
        assert_eq!(request_coding(&hm).unwrap(), ContentCoding::Identity);
        hm.insert("content-encoding", "gzip".parse().unwrap());
        assert_eq!(request_coding(&hm).unwrap(), ContentCoding::Gzip);
        hm.insert("content-encoding", "compress".parse().unwrap());
        assert!(request_coding(&hm).is_err());
    }
}
