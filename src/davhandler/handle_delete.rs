use futures_util::future::{BoxFuture, FutureExt};
use futures_util::StreamExt;
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::{self, if_match_get_tokens};
use crate::davheaders::Depth;
use crate::davpath::DavPath;
use crate::errors::{fserror_to_status, DavError};
use crate::ls::{EffectiveLocks, LockPermission};
use crate::multierror::MultiError;
use crate::util::DavMethod;
use crate::DavResult;

impl crate::DavHandler {
    // depth-first, post-order. A node is only removed when everything
    // below it went; otherwise it reports 424 and stays. COPY/MOVE use
    // this too, for the Overwrite: T pre-delete.
    pub(crate) fn delete_items<'a>(
        &'a self,
        me: &'a mut MultiError,
        path: DavPath,
        is_dir: bool,
        tokens: &'a [String],
    ) -> BoxFuture<'a, bool> {
        async move {
            let mut children_ok = true;
            if is_dir {
                let entries = match self.fs.read_dir(&path).await {
                    Ok(entries) => entries.collect::<Vec<_>>().await,
                    Err(e) => {
                        me.add_status(&path, fserror_to_status(&e));
                        return false;
                    }
                };
                for entry in entries {
                    let mut npath = path.clone();
                    npath.push_segment(&entry.name());
                    let sub_is_dir = match entry.metadata().await {
                        Ok(m) => m.is_dir(),
                        Err(e) => {
                            me.add_status(&npath, fserror_to_status(&e));
                            children_ok = false;
                            continue;
                        }
                    };
                    npath.add_slash_if(sub_is_dir);
                    if !self.delete_items(me, npath, sub_is_dir, tokens).await {
                        children_ok = false;
                    }
                }
            }
            if !children_ok {
                me.add_status(&path, StatusCode::FAILED_DEPENDENCY);
                return false;
            }

            // removing this node is a mapping change.
            if let Some(ls) = &self.ls {
                let eff = EffectiveLocks::gather(&**ls, &path).await;
                if eff.evaluate(DavMethod::Delete, tokens, self.principal_str())
                    != LockPermission::Full
                {
                    me.add_status(&path, StatusCode::LOCKED);
                    return false;
                }
            }

            let result = if is_dir {
                self.fs.remove_dir(&path).await
            } else {
                self.fs.remove_file(&path).await
            };
            match result {
                Ok(()) => {
                    // the resource is gone, its locks die with it.
                    if let Some(ls) = &self.ls {
                        let _ = ls.delete_all(&path).await;
                    }
                    true
                }
                Err(e) => {
                    me.add_status(&path, fserror_to_status(&e));
                    false
                }
            }
        }
        .boxed()
    }

    pub(crate) async fn handle_delete(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let mut path = self.path(req);
        let meta = self.fs.metadata(&path).await?;
        let is_dir = meta.is_dir();
        path.add_slash_if(is_dir);

        // a collection only deletes whole; Depth 0 or 1 makes no sense.
        if is_dir {
            match req.headers().typed_get::<Depth>() {
                None | Some(Depth::Infinity) => {}
                _ => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
            }
        }

        let tokens = if_match_get_tokens(
            req.headers(),
            Some(&*meta),
            &*self.fs,
            self.ls.as_deref(),
            &self.prefix,
            &path,
        )
        .await?;
        if let Some(status) =
            conditional::http_conditionals(req.headers(), DavMethod::Delete, Some(&*meta))
        {
            return Err(DavError::Status(status));
        }

        let mut me = MultiError::new(path.clone());
        self.delete_items(&mut me, path, is_dir, &tokens).await;
        me.final_response(StatusCode::NO_CONTENT)
    }
}
