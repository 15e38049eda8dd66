use std::error::Error as StdError;

use bytes::{Buf, Bytes};
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;

use crate::body::{Body, RequestBody};
use crate::conditional::{self, if_match_get_tokens};
use crate::encoding::{self, ContentCoding};
use crate::errors::DavError;
use crate::fs::OpenOptions;
use crate::ls::{EffectiveLocks, LockPermission};
use crate::util::DavMethod;
use crate::DavResult;

impl crate::DavHandler {
    pub(crate) async fn handle_put<ReqBody, ReqData, ReqError>(
        &self,
        req: &Request<()>,
        mut body: RequestBody<ReqBody>,
        coding: ContentCoding,
    ) -> DavResult<Response<Body>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let path = self.path(req);
        if path.is_collection() {
            return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
        }

        let meta = self.fs.metadata(&path).await.ok();
        if meta.as_ref().map(|m| m.is_dir()).unwrap_or(false) {
            return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
        }
        let exists = meta.is_some();
        if !exists && !self.has_parent(&path).await {
            return Err(DavError::Status(StatusCode::CONFLICT));
        }

        let tokens = if_match_get_tokens(
            req.headers(),
            meta.as_deref(),
            &*self.fs,
            self.ls.as_deref(),
            &self.prefix,
            &path,
        )
        .await?;
        if let Some(status) =
            conditional::http_conditionals(req.headers(), DavMethod::Put, meta.as_deref())
        {
            return Err(DavError::Status(status));
        }

        // replacing a body needs contents permission; creating a new
        // binding needs full permission.
        if let Some(ls) = &self.ls {
            let eff = EffectiveLocks::gather(&**ls, &path).await;
            match eff.evaluate(DavMethod::Put, &tokens, self.principal_str()) {
                LockPermission::Full => {}
                LockPermission::ContentsOnly if exists => {}
                _ => return Err(DavError::Status(StatusCode::LOCKED)),
            }
        }

        // the new bytes only replace the old ones at flush(); bailing
        // out mid-body leaves the previous content in place.
        let mut file = self.fs.open(&path, OpenOptions::write()).await?;

        if coding == ContentCoding::Identity {
            while let Some(chunk) = body.chunk().await? {
                file.write_buf(Box::new(chunk)).await?;
            }
        } else {
            // encoded bodies cannot be streamed through; buffer, decode,
            // write in one go.
            let data = body.read_to_end(usize::MAX).await?;
            let data = encoding::decode_bytes(data, coding).await?;
            file.write_bytes(Bytes::from(data)).await?;
        }
        file.flush().await?;

        // a successful PUT turns a lock-null resource into a real one.
        if let Some(ls) = &self.ls {
            for token in &tokens {
                let _ = ls.make_permanent(&path, token).await;
            }
        }

        let mut res = Response::new(Body::empty());
        if let Ok(meta) = file.metadata().await {
            if let Some(etag) = conditional::quoted_etag(&*meta) {
                res.headers_mut().typed_insert(etag);
            }
        }
        res.headers_mut().insert("content-length", "0".parse().unwrap());
        *res.status_mut() = if exists {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };
        Ok(res)
    }
}
