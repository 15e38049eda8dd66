use std::io::Cursor;
use std::time::SystemTime;

use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use uuid::Uuid;
use xmltree::Element;

use crate::body::Body;
use crate::conditional::if_match_get_tokens;
use crate::davheaders::{self, Depth, LockToken};
use crate::errors::DavError;
use crate::fs::OpenOptions;
use crate::ls::{DavLock, EffectiveLocks, LockPermission};
use crate::util::{DavMethod, MemBuffer};
use crate::xmltree_ext::{self, ElementExt, NsScope, NS_DAV_URI};
use crate::DavResult;

// <D:supportedlock> for the live property: write locks, both scopes.
pub(crate) fn list_supportedlock() -> Element {
    let mut sup = Element::new2("D:supportedlock");
    for scope in ["D:exclusive", "D:shared"] {
        let mut entry = Element::new2("D:lockentry");
        let mut lockscope = Element::new2("D:lockscope");
        lockscope.children.push(Element::new2(scope));
        let mut locktype = Element::new2("D:locktype");
        locktype.children.push(Element::new2("D:write"));
        entry.children.push(lockscope);
        entry.children.push(locktype);
        sup.children.push(entry);
    }
    sup
}

// <D:lockdiscovery> for the live property.
pub(crate) fn list_lockdiscovery(locks: &[DavLock]) -> Element {
    let mut disc = Element::new2("D:lockdiscovery");
    for lock in locks {
        disc.children.push(activelock(lock));
    }
    disc
}

fn activelock(lock: &DavLock) -> Element {
    let mut active = Element::new2("D:activelock");

    let mut lockscope = Element::new2("D:lockscope");
    lockscope.children.push(Element::new2(if lock.shared {
        "D:shared"
    } else {
        "D:exclusive"
    }));
    active.children.push(lockscope);

    let mut locktype = Element::new2("D:locktype");
    locktype.children.push(Element::new2("D:write"));
    active.children.push(locktype);

    active.children.push(
        Element::new2("D:depth").text(if lock.deep { "infinity" } else { "0" }),
    );

    if let Some(owner) = &lock.owner {
        active.children.push(owner.clone());
    }

    let timeout = match lock.timeout {
        None => "Infinite".to_string(),
        Some(t) => {
            let elapsed = lock.date.elapsed().unwrap_or_default();
            format!("Second-{}", t.saturating_sub(elapsed).as_secs())
        }
    };
    active.children.push(Element::new2("D:timeout").text(timeout));

    let mut locktoken = Element::new2("D:locktoken");
    locktoken
        .children
        .push(Element::new2("D:href").text(lock.token.clone()));
    active.children.push(locktoken);

    let mut lockroot = Element::new2("D:lockroot");
    lockroot
        .children
        .push(Element::new2("D:href").text(lock.path.as_url_string_with_prefix()));
    active.children.push(lockroot);

    active
}

// 200/201 response carrying <D:prop><D:lockdiscovery> and the token.
fn lock_response(lock: &DavLock, created: bool) -> DavResult<Response<Body>> {
    let mut buffer = MemBuffer::new();
    let mut emitter = xmltree_ext::emitter(buffer.clone())?;
    let mut scope: NsScope = vec![(Some("D".to_string()), NS_DAV_URI.to_string())];

    emitter.write(xml::writer::XmlEvent::start_element("D:prop").ns("D", NS_DAV_URI))?;
    xmltree_ext::write_elem(&list_lockdiscovery(std::slice::from_ref(lock)), &mut emitter, &mut scope)?;
    emitter.write(xml::writer::XmlEvent::end_element())?;

    let mut res = Response::new(Body::from(buffer.take()));
    *res.status_mut() = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    res.headers_mut().insert(
        "content-type",
        "application/xml; charset=utf-8".parse().unwrap(),
    );
    res.headers_mut()
        .typed_insert(LockToken(lock.token.clone()));
    Ok(res)
}

// 423 telling the client which locks stand in the way.
fn conflict_response(eff: &EffectiveLocks) -> DavResult<Response<Body>> {
    let mut buffer = MemBuffer::new();
    let mut emitter = xmltree_ext::emitter(buffer.clone())?;

    emitter.write(xml::writer::XmlEvent::start_element("D:error").ns("D", NS_DAV_URI))?;
    emitter.write(xml::writer::XmlEvent::start_element("D:no-conflicting-lock"))?;
    for lock in eff.conflicting() {
        Element::new2("D:href")
            .text(lock.path.as_url_string_with_prefix())
            .write_ev(&mut emitter)?;
    }
    emitter.write(xml::writer::XmlEvent::end_element())?;
    emitter.write(xml::writer::XmlEvent::end_element())?;

    let mut res = Response::new(Body::from(buffer.take()));
    *res.status_mut() = StatusCode::LOCKED;
    res.headers_mut().insert(
        "content-type",
        "application/xml; charset=utf-8".parse().unwrap(),
    );
    Ok(res)
}

impl crate::DavHandler {
    pub(crate) async fn handle_lock(
        &self,
        req: &Request<()>,
        xmldata: &[u8],
    ) -> DavResult<Response<Body>> {
        let Some(ls) = self.ls.clone() else {
            return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
        };

        let mut path = self.path(req);
        let meta = self.fs.metadata(&path).await.ok();
        if let Some(m) = &meta {
            path.add_slash_if(m.is_dir());
        }
        let exists = meta.is_some();
        let is_dir = meta.as_ref().map(|m| m.is_dir()).unwrap_or(false);

        let timeout = req
            .headers()
            .typed_get::<davheaders::Timeout>()
            .map(|t| t.pick(self.max_timeout))
            .unwrap_or(self.max_timeout);

        let tokens = if_match_get_tokens(
            req.headers(),
            meta.as_deref(),
            &*self.fs,
            Some(&*ls),
            &self.prefix,
            &path,
        )
        .await?;

        // empty body: refresh of a lock we already hold.
        if xmldata.is_empty() {
            if tokens.is_empty() {
                return Err(DavError::Status(StatusCode::BAD_REQUEST));
            }
            let held = ls.list(&path).await;
            for lock in held {
                if !tokens.contains(&lock.token) {
                    continue;
                }
                if !lock.matches_principal(self.principal_str()) {
                    return Err(DavError::Status(StatusCode::FORBIDDEN));
                }
                if let Ok(lock) = ls.refresh(&path, &lock.token, Some(timeout)).await {
                    return lock_response(&lock, false);
                }
            }
            return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
        }

        // new lock: parse <D:lockinfo>.
        let tree = Element::parse2(Cursor::new(xmldata))?;
        if tree.name != "lockinfo" || tree.namespace.as_deref() != Some(NS_DAV_URI) {
            return Err(DavError::XmlParseError);
        }
        let shared = match tree
            .get_child("lockscope")
            .and_then(|e| e.children.first())
            .map(|e| e.name.as_str())
        {
            Some("exclusive") => false,
            Some("shared") => true,
            _ => return Err(DavError::XmlParseError),
        };
        match tree
            .get_child("locktype")
            .and_then(|e| e.children.first())
            .map(|e| e.name.as_str())
        {
            Some("write") => {}
            _ => return Err(DavError::XmlParseError),
        }
        let owner = tree.get_child("owner").cloned().map(|mut o| {
            o.prefix = Some("D".to_string());
            o.namespace = Some(NS_DAV_URI.to_string());
            o
        });

        let deep = match req.headers().typed_get::<Depth>() {
            None | Some(Depth::Zero) => false,
            Some(Depth::Infinity) => true,
            Some(Depth::One) => return Err(DavError::Status(StatusCode::BAD_REQUEST)),
        };
        if deep && !is_dir && exists {
            return Err(DavError::Status(StatusCode::BAD_REQUEST));
        }

        if !exists && !self.has_parent(&path).await {
            return Err(DavError::Status(StatusCode::CONFLICT));
        }

        let eff = EffectiveLocks::gather(&*ls, &path).await;
        let allowed = match eff.evaluate(DavMethod::Lock, &tokens, self.principal_str()) {
            LockPermission::Full => true,
            LockPermission::SharedOk => shared,
            // a depth-0 parent lock only guards the mapping; locking an
            // existing child is fine, minting a lock-null child is not.
            LockPermission::ContentsOnly => exists,
            LockPermission::Denied => false,
        };
        if !allowed {
            // an exclusive holder turns a shared request into a flat
            // conflict; an exclusive request gets the 423 enumeration.
            if shared && eff.all().any(|l| !l.shared) {
                return Err(DavError::Status(StatusCode::CONFLICT));
            }
            return conflict_response(&eff);
        }

        // lock-null resource: reserve the name with an empty body.
        if !exists {
            let mut file = self.fs.open(&path, OpenOptions::write()).await?;
            file.flush().await?;
        }

        let lock = DavLock {
            token: format!("urn:uuid:{}", Uuid::new_v4()),
            path: path.clone(),
            principal: self.principal_str().map(|s| s.to_string()),
            date: SystemTime::now(),
            timeout: Some(timeout),
            shared,
            deep,
            owner,
            provisional: !exists,
        };
        match ls.add(lock).await {
            Ok(lock) => lock_response(&lock, !exists),
            // lost the race against a concurrent LOCK.
            Err(other) => {
                debug!("lock on {path} conflicts with {}", other.token);
                let eff = EffectiveLocks::gather(&*ls, &path).await;
                conflict_response(&eff)
            }
        }
    }

    pub(crate) async fn handle_unlock(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let Some(ls) = self.ls.clone() else {
            return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
        };
        let token = req
            .headers()
            .typed_get::<LockToken>()
            .ok_or(DavError::Status(StatusCode::BAD_REQUEST))?;

        let mut path = self.path(req);
        let meta = self.fs.metadata(&path).await.ok();
        if let Some(m) = &meta {
            path.add_slash_if(m.is_dir());
        }

        let locks = ls.list(&path).await;
        let Some(lock) = locks.iter().find(|l| l.token == token.0) else {
            // no such lock on this resource.
            return Err(DavError::Status(StatusCode::CONFLICT));
        };
        if !lock.matches_principal(self.principal_str()) {
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }
        let was_provisional = lock.provisional;
        let _ = ls.delete(&path, &token.0).await;

        // reap a lock-null resource once its last lock is gone.
        if was_provisional && ls.list(&path).await.is_empty() {
            if let Some(m) = &meta {
                if m.is_file() && m.len() == 0 {
                    let _ = self.fs.remove_file(&path).await;
                }
            }
        }

        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::NO_CONTENT;
        Ok(res)
    }
}
