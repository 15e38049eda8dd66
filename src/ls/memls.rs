//! Ephemeral in-memory locksystem.
//!
//! All lock state sits behind one mutex, which doubles as the
//! serialization the [`DavLockSystem`] contract asks for: `add`
//! re-checks for conflicts while holding it, so a racing permission
//! check can never hand out two exclusive locks.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use futures_util::future::{ready, FutureExt};

use crate::davpath::DavPath;
use crate::ls::*;

/// Ephemeral in-memory locksystem.
#[derive(Debug, Default)]
pub struct MemLs {
    locks: Mutex<HashMap<String, Vec<DavLock>>>,
}

fn key(path: &DavPath) -> String {
    let s = path.as_url_string();
    match s.trim_end_matches('/') {
        "" => "/".to_string(),
        t => t.to_string(),
    }
}

// two locks on overlapping scopes can only coexist when both are shared.
fn conflicts(a: &DavLock, b: &DavLock) -> bool {
    !(a.shared && b.shared)
}

fn purge(map: &mut HashMap<String, Vec<DavLock>>, now: SystemTime) {
    map.retain(|_, v| {
        v.retain(|l| !l.is_expired(now));
        !v.is_empty()
    });
}

impl MemLs {
    /// Create a new "memls" locksystem.
    pub fn new() -> Arc<MemLs> {
        Arc::new(MemLs::default())
    }
}

impl DavLockSystem for MemLs {
    fn list<'a>(&'a self, path: &'a DavPath) -> LsFuture<'a, Vec<DavLock>> {
        let mut map = self.locks.lock().unwrap();
        purge(&mut map, SystemTime::now());
        let v = map.get(&key(path)).cloned().unwrap_or_default();
        ready(v).boxed()
    }

    fn list_by_user<'a>(
        &'a self,
        path: &'a DavPath,
        principal: Option<&'a str>,
    ) -> LsFuture<'a, Vec<DavLock>> {
        let mut map = self.locks.lock().unwrap();
        purge(&mut map, SystemTime::now());
        let v = map
            .get(&key(path))
            .map(|v| {
                v.iter()
                    .filter(|l| l.matches_principal(principal))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        ready(v).boxed()
    }

    fn add<'a>(&'a self, lock: DavLock) -> LsFuture<'a, Result<DavLock, DavLock>> {
        let mut map = self.locks.lock().unwrap();
        purge(&mut map, SystemTime::now());
        // re-check under the mutex: same resource, a deep lock on an
        // ancestor, or (for a deep lock) anything below us.
        for other in map.values().flatten() {
            let overlap = other.path == lock.path
                || (other.deep && other.path.is_ancestor_of(&lock.path))
                || (lock.deep && lock.path.is_ancestor_of(&other.path));
            if overlap && conflicts(other, &lock) {
                return ready(Err(other.clone())).boxed();
            }
        }
        map.entry(key(&lock.path)).or_default().push(lock.clone());
        ready(Ok(lock)).boxed()
    }

    fn refresh<'a>(
        &'a self,
        path: &'a DavPath,
        token: &'a str,
        timeout: Option<Duration>,
    ) -> LsFuture<'a, Result<DavLock, ()>> {
        let mut map = self.locks.lock().unwrap();
        purge(&mut map, SystemTime::now());
        let res = map
            .get_mut(&key(path))
            .and_then(|v| v.iter_mut().find(|l| l.token == token))
            .map(|l| {
                l.date = SystemTime::now();
                l.timeout = timeout;
                l.clone()
            })
            .ok_or(());
        ready(res).boxed()
    }

    fn make_permanent<'a>(
        &'a self,
        path: &'a DavPath,
        token: &'a str,
    ) -> LsFuture<'a, Result<(), ()>> {
        let mut map = self.locks.lock().unwrap();
        let res = map
            .get_mut(&key(path))
            .and_then(|v| v.iter_mut().find(|l| l.token == token))
            .map(|l| l.provisional = false)
            .ok_or(());
        ready(res).boxed()
    }

    fn delete<'a>(&'a self, path: &'a DavPath, token: &'a str) -> LsFuture<'a, Result<(), ()>> {
        let mut map = self.locks.lock().unwrap();
        let k = key(path);
        let res = match map.get_mut(&k) {
            Some(v) => {
                let len = v.len();
                v.retain(|l| l.token != token);
                let removed = v.len() < len;
                if v.is_empty() {
                    map.remove(&k);
                }
                if removed {
                    Ok(())
                } else {
                    Err(())
                }
            }
            None => Err(()),
        };
        ready(res).boxed()
    }

    fn delete_all<'a>(&'a self, path: &'a DavPath) -> LsFuture<'a, Result<(), ()>> {
        let mut map = self.locks.lock().unwrap();
        let base = key(path);
        let prefix = format!("{}/", base.trim_end_matches('/'));
        map.retain(|k, _| k != &base && !k.starts_with(&prefix));
        ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ls::{EffectiveLocks, LockPermission};
    use crate::util::DavMethod;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    fn lock(path: &str, shared: bool, deep: bool, principal: &str) -> DavLock {
        DavLock {
            token: format!("urn:uuid:{}", uuid::Uuid::new_v4()),
            path: p(path),
            principal: Some(principal.to_string()),
            date: SystemTime::now(),
            timeout: Some(Duration::from_secs(600)),
            shared,
            deep,
            owner: None,
            provisional: false,
        }
    }

    #[tokio::test]
    async fn test_add_conflict() {
        let ls = MemLs::new();
        ls.add(lock("/f", false, false, "alice")).await.unwrap();
        assert!(ls.add(lock("/f", false, false, "bob")).await.is_err());
        assert!(ls.add(lock("/f", true, false, "bob")).await.is_err());
        // shared next to shared is fine.
        ls.add(lock("/g", true, false, "alice")).await.unwrap();
        ls.add(lock("/g", true, false, "bob")).await.unwrap();
    }

    #[tokio::test]
    async fn test_deep_lock_covers_subtree() {
        let ls = MemLs::new();
        ls.add(lock("/c/", false, true, "alice")).await.unwrap();
        assert!(ls.add(lock("/c/x/y", false, false, "bob")).await.is_err());

        let eff = EffectiveLocks::gather(&*ls, &p("/c/x/y")).await;
        assert_eq!(eff.depth_infinity.len(), 1);
        assert_eq!(eff.resource.len() + eff.depth_zero.len(), 0);
        assert_eq!(
            eff.evaluate(DavMethod::Put, &[], Some("bob")),
            LockPermission::Denied
        );
    }

    #[tokio::test]
    async fn test_depth_zero_only_reaches_children() {
        let ls = MemLs::new();
        ls.add(lock("/c/", false, false, "alice")).await.unwrap();

        let eff = EffectiveLocks::gather(&*ls, &p("/c/x")).await;
        assert_eq!(eff.depth_zero.len(), 1);
        // not visible from a grandchild.
        let eff = EffectiveLocks::gather(&*ls, &p("/c/x/y")).await;
        assert!(eff.is_empty());
    }

    #[tokio::test]
    async fn test_expired_locks_never_decide() {
        let ls = MemLs::new();
        let mut l = lock("/f", false, false, "alice");
        l.timeout = Some(Duration::from_secs(1));
        l.date = SystemTime::now() - Duration::from_secs(5);
        ls.add(l).await.unwrap();

        let eff = EffectiveLocks::gather(&*ls, &p("/f")).await;
        assert!(eff.is_empty());
        assert_eq!(
            eff.evaluate(DavMethod::Put, &[], Some("bob")),
            LockPermission::Full
        );
        // the store purged it for good.
        assert!(ls.list(&p("/f")).await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_keeps_identity() {
        let ls = MemLs::new();
        let l = ls.add(lock("/f", false, false, "alice")).await.unwrap();
        let r = ls
            .refresh(&p("/f"), &l.token, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(r.token, l.token);
        assert_eq!(r.timeout, Some(Duration::from_secs(60)));
        assert_eq!(r.principal.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_delete_all_subtree() {
        let ls = MemLs::new();
        ls.add(lock("/c/x", false, false, "alice")).await.unwrap();
        ls.add(lock("/c/y", true, false, "bob")).await.unwrap();
        ls.delete_all(&p("/c/")).await.unwrap();
        assert!(ls.list(&p("/c/x")).await.is_empty());
        assert!(ls.list(&p("/c/y")).await.is_empty());
    }
}
