use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::if_match_get_tokens;
use crate::errors::DavError;
use crate::ls::{EffectiveLocks, LockPermission};
use crate::util::DavMethod;
use crate::DavResult;

impl crate::DavHandler {
    pub(crate) async fn handle_mkcol(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let mut path = self.path(req);
        path.add_slash();

        // parent must exist and be a collection.
        if !self.has_parent(&path).await {
            return Err(DavError::Status(StatusCode::CONFLICT));
        }
        // target must not be mapped yet.
        if self.fs.metadata(&path).await.is_ok() {
            return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
        }

        let tokens = if_match_get_tokens(
            req.headers(),
            None,
            &*self.fs,
            self.ls.as_deref(),
            &self.prefix,
            &path,
        )
        .await?;

        // creating a binding in the parent is a mapping change.
        if let Some(ls) = &self.ls {
            let eff = EffectiveLocks::gather(&**ls, &path).await;
            if eff.evaluate(DavMethod::MkCol, &tokens, self.principal_str())
                != LockPermission::Full
            {
                return Err(DavError::Status(StatusCode::LOCKED));
            }
        }

        self.fs.create_dir(&path).await?;

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::CREATED;
        res.headers_mut().insert("content-length", "0".parse().unwrap());
        Ok(res)
    }
}
