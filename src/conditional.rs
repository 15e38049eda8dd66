//
// Evaluation of the conditional request headers: the HTTP set
// (If-Match / If-None-Match / If-Modified-Since / If-Unmodified-Since)
// and the webdav `If` header with its tagged lists.
//
use headers::{ETag, HeaderMapExt, IfMatch, IfModifiedSince, IfNoneMatch, IfUnmodifiedSince};
use http::{HeaderMap, StatusCode};

use crate::davheaders::{self, IfItem};
use crate::davpath::DavPath;
use crate::fs::{DavFileSystem, DavMetaData};
use crate::ls::{DavLockSystem, EffectiveLocks};
use crate::util::DavMethod;
use crate::DavResult;

pub(crate) fn quoted_etag(meta: &dyn DavMetaData) -> Option<ETag> {
    meta.etag()
        .and_then(|etag| format!("\"{etag}\"").parse::<ETag>().ok())
}

// Weak comparison: strip a W/ marker off both sides.
fn etag_matches(sent: &str, current: &str) -> bool {
    let strip = |s: &str| s.trim().trim_start_matches("W/").to_string();
    strip(sent) == strip(current)
}

/// Evaluate the RFC 7232 conditionals against the current state of the
/// target. Returns the status to answer with, or None to continue.
pub(crate) fn http_conditionals(
    headers: &HeaderMap,
    method: DavMethod,
    meta: Option<&dyn DavMetaData>,
) -> Option<StatusCode> {
    let is_get = method == DavMethod::Get || method == DavMethod::Head;
    let etag = meta.and_then(quoted_etag);
    let modified = meta.and_then(|m| m.modified().ok());

    if let Some(im) = headers.typed_get::<IfMatch>() {
        let pass = match &etag {
            Some(etag) => im.precondition_passes(etag),
            None => false,
        };
        if !pass {
            return Some(StatusCode::PRECONDITION_FAILED);
        }
    } else if let Some(ius) = headers.typed_get::<IfUnmodifiedSince>() {
        match modified {
            Some(m) if ius.precondition_passes(m) => {}
            _ => return Some(StatusCode::PRECONDITION_FAILED),
        }
    }

    if let Some(inm) = headers.typed_get::<IfNoneMatch>() {
        let pass = match &etag {
            Some(etag) => inm.precondition_passes(etag),
            None => true,
        };
        if !pass {
            return Some(if is_get {
                StatusCode::NOT_MODIFIED
            } else {
                StatusCode::PRECONDITION_FAILED
            });
        }
    } else if is_get {
        if let (Some(ims), Some(m)) = (headers.typed_get::<IfModifiedSince>(), modified) {
            if !ims.is_modified(m) {
                return Some(StatusCode::NOT_MODIFIED);
            }
        }
    }
    None
}

// Tagged list target: Coded-URL, either an absolute URI or a path.
fn resolve_target(resource: &str, prefix: &str) -> Option<DavPath> {
    let path = if resource.starts_with('/') {
        resource
    } else {
        let uri = resource.parse::<http::Uri>().ok()?;
        // only the path matters, the authority was for routing.
        return DavPath::from_str_and_prefix(uri.path(), prefix).ok();
    };
    DavPath::from_str_and_prefix(path, prefix).ok()
}

/// Evaluate the `If` header and return the submitted lock tokens.
///
/// Every token mentioned anywhere counts as submitted. The header as a
/// whole must hold (one list per tagged target must be true), otherwise
/// the request fails with 412.
pub(crate) async fn if_match_get_tokens(
    headers: &HeaderMap,
    meta: Option<&dyn DavMetaData>,
    fs: &dyn DavFileSystem,
    ls: Option<&dyn DavLockSystem>,
    prefix: &str,
    path: &DavPath,
) -> DavResult<Vec<String>> {
    let Some(if_header) = headers.typed_get::<davheaders::If>() else {
        return Ok(Vec::new());
    };
    let tokens: Vec<String> = if_header
        .submitted_tokens()
        .map(|s| s.to_string())
        .collect();

    let mut any_ok = false;
    for list in &if_header.0 {
        let target = match &list.resource {
            None => path.clone(),
            Some(r) => match resolve_target(r, prefix) {
                Some(t) => t,
                // a tagged target outside our tree can never match.
                None => continue,
            },
        };

        // current state of the target this list applies to.
        let target_etag = if target == *path {
            meta.and_then(|m| m.etag())
        } else {
            match fs.metadata(&target).await {
                Ok(m) => m.etag(),
                Err(_) => None,
            }
        };
        let target_locks = match ls {
            Some(ls) => EffectiveLocks::gather(ls, &target).await,
            None => EffectiveLocks::default(),
        };

        let mut list_ok = true;
        for cond in &list.conditions {
            let state = match &cond.item {
                IfItem::Token(token) => target_locks.all().any(|l| &l.token == token),
                IfItem::ETag(sent) => match &target_etag {
                    Some(cur) => etag_matches(sent, &format!("\"{cur}\"")),
                    None => false,
                },
            };
            if state == cond.not {
                list_ok = false;
                break;
            }
        }
        if list_ok {
            any_ok = true;
        }
    }

    if !any_ok {
        return Err(StatusCode::PRECONDITION_FAILED.into());
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::memfs::MemFs;
    use crate::fs::OpenOptions;
    use crate::ls::memls::MemLs;
    use crate::ls::DavLock;
    use std::time::{Duration, SystemTime};

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    fn headers_with_if(value: &str) -> HeaderMap {
        let mut hm = HeaderMap::new();
        hm.insert("if", value.parse().unwrap());
        hm
    }

    #[tokio::test]
    async fn test_no_if_header_is_ok() {
        let fs = MemFs::new();
        let tokens = if_match_get_tokens(&HeaderMap::new(), None, &*fs, None, "", &p("/f"))
            .await
            .unwrap();
        assert!(tokens.is_empty());
    }

    #[tokio::test]
    async fn test_token_condition() {
        let fs = MemFs::new();
        let ls = MemLs::new();
        let mut f = fs.open(&p("/f"), OpenOptions::write()).await.unwrap();
        f.flush().await.unwrap();
        ls.add(DavLock {
            token: "urn:uuid:99".to_string(),
            path: p("/f"),
            principal: Some("alice".to_string()),
            date: SystemTime::now(),
            timeout: Some(Duration::from_secs(600)),
            shared: false,
            deep: false,
            owner: None,
            provisional: false,
        })
        .await
        .unwrap();

        let ok = if_match_get_tokens(
            &headers_with_if("(<urn:uuid:99>)"),
            None,
            &*fs,
            Some(&*ls),
            "",
            &p("/f"),
        )
        .await
        .unwrap();
        assert_eq!(ok, vec!["urn:uuid:99".to_string()]);

        // unknown token: the condition fails, so the request fails.
        let err = if_match_get_tokens(
            &headers_with_if("(<urn:uuid:other>)"),
            None,
            &*fs,
            Some(&*ls),
            "",
            &p("/f"),
        )
        .await;
        assert!(err.is_err());

        // ... unless negated.
        let ok = if_match_get_tokens(
            &headers_with_if("(Not <urn:uuid:other>)"),
            None,
            &*fs,
            Some(&*ls),
            "",
            &p("/f"),
        )
        .await
        .unwrap();
        assert_eq!(ok, vec!["urn:uuid:other".to_string()]);
    }

    #[tokio::test]
    async fn test_etag_condition() {
        let fs = MemFs::new();
        let mut f = fs.open(&p("/f"), OpenOptions::write()).await.unwrap();
        f.write_bytes(bytes::Bytes::from_static(b"x")).await.unwrap();
        f.flush().await.unwrap();
        let meta = fs.metadata(&p("/f")).await.unwrap();
        let etag = meta.etag().unwrap();

        let hm = headers_with_if(&format!("([\"{etag}\"])"));
        assert!(
            if_match_get_tokens(&hm, Some(&*meta), &*fs, None, "", &p("/f"))
                .await
                .is_ok()
        );

        let hm = headers_with_if("([\"stale\"])");
        assert!(
            if_match_get_tokens(&hm, Some(&*meta), &*fs, None, "", &p("/f"))
                .await
                .is_err()
        );
    }
}
