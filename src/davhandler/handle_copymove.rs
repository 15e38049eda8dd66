use futures_util::future::{BoxFuture, FutureExt};
use futures_util::StreamExt;
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::{self, if_match_get_tokens};
use crate::davheaders::{Depth, Destination, Overwrite};
use crate::davpath::DavPath;
use crate::errors::{fserror_to_status, DavError};
use crate::ls::{DavLock, EffectiveLocks, LockPermission};
use crate::multierror::MultiError;
use crate::util::DavMethod;
use crate::DavResult;

impl crate::DavHandler {
    // copy one node, then (unless Depth 0) its children. Failures are
    // per-resource; siblings still get their chance.
    fn copy_items<'a>(
        &'a self,
        me: &'a mut MultiError,
        from: DavPath,
        to: DavPath,
        is_dir: bool,
        deep: bool,
    ) -> BoxFuture<'a, bool> {
        async move {
            if let Err(e) = self.fs.copy(&from, &to).await {
                debug!("copy {from} -> {to} failed: {e:?}");
                me.add_status(&from, fserror_to_status(&e));
                return false;
            }
            if !is_dir || !deep {
                return true;
            }
            let entries = match self.fs.read_dir(&from).await {
                Ok(entries) => entries.collect::<Vec<_>>().await,
                Err(e) => {
                    me.add_status(&from, fserror_to_status(&e));
                    return false;
                }
            };
            let mut ok = true;
            for entry in entries {
                let name = entry.name();
                let sub_is_dir = match entry.metadata().await {
                    Ok(m) => m.is_dir(),
                    Err(_) => continue,
                };
                let mut nfrom = from.clone();
                nfrom.push_segment(&name);
                nfrom.add_slash_if(sub_is_dir);
                let mut nto = to.clone();
                nto.push_segment(&name);
                nto.add_slash_if(sub_is_dir);
                if !self.copy_items(me, nfrom, nto, sub_is_dir, deep).await {
                    ok = false;
                }
            }
            ok
        }
        .boxed()
    }

    // every lock held anywhere in the subtree; MOVE needs them to
    // decide whether the locks travel along.
    fn subtree_locks<'a>(&'a self, path: DavPath, is_dir: bool) -> BoxFuture<'a, Vec<DavLock>> {
        async move {
            let Some(ls) = &self.ls else {
                return Vec::new();
            };
            let mut locks = ls.list(&path).await;
            if !is_dir {
                return locks;
            }
            if let Ok(entries) = self.fs.read_dir(&path).await {
                let entries = entries.collect::<Vec<_>>().await;
                for entry in entries {
                    let sub_is_dir = match entry.metadata().await {
                        Ok(m) => m.is_dir(),
                        Err(_) => continue,
                    };
                    let mut npath = path.clone();
                    npath.push_segment(&entry.name());
                    npath.add_slash_if(sub_is_dir);
                    locks.extend(self.subtree_locks(npath, sub_is_dir).await);
                }
            }
            locks
        }
        .boxed()
    }

    pub(crate) async fn handle_copymove(
        &self,
        req: &Request<()>,
        method: DavMethod,
    ) -> DavResult<Response<Body>> {
        let mut path = self.path(req);
        let meta = self.fs.metadata(&path).await?;
        let is_dir = meta.is_dir();
        path.add_slash_if(is_dir);

        let dest = req
            .headers()
            .typed_get::<Destination>()
            .ok_or(DavError::Status(StatusCode::BAD_REQUEST))?;
        // an absolute Destination must point back at us.
        if let Some(authority) = &dest.authority {
            let host = req.headers().get("host").and_then(|v| v.to_str().ok());
            if host != Some(authority.as_str()) {
                return Err(DavError::Status(StatusCode::BAD_REQUEST));
            }
        }
        let mut dest_path = DavPath::from_str_and_prefix(&dest.path, &self.prefix)?;

        // a destination inside the source can only recurse forever.
        if path.is_ancestor_of(&dest_path) || dest_path.is_ancestor_of(&path) {
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }

        let deep = match (method, req.headers().typed_get::<Depth>()) {
            (_, None) | (_, Some(Depth::Infinity)) => true,
            (DavMethod::Copy, Some(Depth::Zero)) => false,
            _ => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
        };

        let tokens = if_match_get_tokens(
            req.headers(),
            Some(&*meta),
            &*self.fs,
            self.ls.as_deref(),
            &self.prefix,
            &path,
        )
        .await?;
        if let Some(status) = conditional::http_conditionals(req.headers(), method, Some(&*meta)) {
            return Err(DavError::Status(status));
        }

        if let Some(ls) = &self.ls {
            // MOVE unmaps the source.
            if method == DavMethod::Move {
                let eff = EffectiveLocks::gather(&**ls, &path).await;
                if eff.evaluate(method, &tokens, self.principal_str()) != LockPermission::Full {
                    return Err(DavError::Status(StatusCode::LOCKED));
                }
            }
            // and both verbs map the destination.
            let eff = EffectiveLocks::gather(&**ls, &dest_path).await;
            if eff.evaluate(method, &tokens, self.principal_str()) != LockPermission::Full {
                return Err(DavError::Status(StatusCode::LOCKED));
            }
        }

        let overwrite = req
            .headers()
            .typed_get::<Overwrite>()
            .map(|o| o.0)
            .unwrap_or(true);
        let dest_meta = self.fs.metadata(&dest_path).await.ok();
        let dest_exists = dest_meta.is_some();
        if dest_exists && !overwrite {
            return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
        }
        if !self.has_parent(&dest_path).await {
            return Err(DavError::Status(StatusCode::CONFLICT));
        }

        let mut me = MultiError::new(path.clone());

        // Overwrite: T pre-deletes whatever is at the destination.
        if let Some(dmeta) = dest_meta {
            let mut dpath = dest_path.clone();
            let ddir = dmeta.is_dir();
            dpath.add_slash_if(ddir);
            if !self.delete_items(&mut me, dpath, ddir, &tokens).await {
                return me.final_response(StatusCode::NO_CONTENT);
            }
        }
        dest_path.add_slash_if(is_dir);

        if method == DavMethod::Copy {
            // locks do not travel on COPY.
            self.copy_items(&mut me, path, dest_path, is_dir, deep).await;
        } else {
            let locks = self.subtree_locks(path.clone(), is_dir).await;
            self.fs.rename(&path, &dest_path).await?;
            if let Some(ls) = &self.ls {
                // locks move along only when the principal owns them
                // all; otherwise the move sheds them.
                let preserve = !locks.is_empty()
                    && locks.iter().all(|l| l.matches_principal(self.principal_str()));
                for lock in locks {
                    let _ = ls.delete(&lock.path, &lock.token).await;
                    if preserve {
                        let mut lock = lock;
                        lock.path = lock.path.rebase(&path, &dest_path);
                        let _ = ls.add(lock).await;
                    }
                }
            }
        }

        me.final_response(if dest_exists {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        })
    }
}
