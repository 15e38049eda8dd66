//! Locking: the lock data model, the storage trait, and the engine
//! that turns stored locks into a permission decision.
//!
//! Lock persistence is the backend's job. The engine in this module is
//! read-only: it collects the locks that apply to a target resource
//! (on the resource itself, depth-0 on the immediate parent, depth-∞
//! on any ancestor) and arbitrates what the request may do given the
//! tokens it submitted.
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use xmltree::Element;

use crate::davpath::DavPath;
use crate::util::DavMethod;

pub mod memls;

/// Future type returned by the locksystem methods.
pub type LsFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A lock on a resource.
#[derive(Debug, Clone)]
pub struct DavLock {
    /// `urn:uuid:` UUID v4 token.
    pub token: String,
    /// Resource holding the lock.
    pub path: DavPath,
    /// Principal that created the lock.
    pub principal: Option<String>,
    /// Creation time.
    pub date: SystemTime,
    /// Lifetime. None means the lock never expires.
    pub timeout: Option<Duration>,
    /// Shared or exclusive.
    pub shared: bool,
    /// Depth: infinity or 0.
    pub deep: bool,
    /// Free-form `<owner>` fragment from the LOCK body.
    pub owner: Option<Element>,
    /// Still tied to a lock-null resource; becomes permanent on PUT.
    pub provisional: bool,
}

impl DavLock {
    pub(crate) fn is_expired(&self, now: SystemTime) -> bool {
        match self.timeout {
            None => false,
            Some(t) => self.date + t <= now,
        }
    }

    /// Lock ownership is by principal, not by token possession alone.
    pub(crate) fn matches_principal(&self, principal: Option<&str>) -> bool {
        self.principal.as_deref() == principal
    }
}

/// The trait that defines a locksystem backend.
///
/// Implementations must serialize concurrent mutations themselves, and
/// `add` must re-check for conflicts under that serialization: the
/// handler's own permission check may race with another request.
pub trait DavLockSystem: Send + Sync {
    /// Locks held directly on a path. Expired locks are purged, not
    /// returned.
    fn list<'a>(&'a self, path: &'a DavPath) -> LsFuture<'a, Vec<DavLock>>;

    /// Locks held directly on a path by one principal.
    fn list_by_user<'a>(
        &'a self,
        path: &'a DavPath,
        principal: Option<&'a str>,
    ) -> LsFuture<'a, Vec<DavLock>>;

    /// Store a new lock. Fails with the first conflicting lock.
    fn add<'a>(&'a self, lock: DavLock) -> LsFuture<'a, Result<DavLock, DavLock>>;

    /// Reset the timeout on an existing lock.
    fn refresh<'a>(
        &'a self,
        path: &'a DavPath,
        token: &'a str,
        timeout: Option<Duration>,
    ) -> LsFuture<'a, Result<DavLock, ()>>;

    /// Clear the provisional flag; the lock-null resource became real.
    fn make_permanent<'a>(&'a self, path: &'a DavPath, token: &'a str)
        -> LsFuture<'a, Result<(), ()>>;

    /// Delete one lock.
    fn delete<'a>(&'a self, path: &'a DavPath, token: &'a str) -> LsFuture<'a, Result<(), ()>>;

    /// Delete every lock on a path, and below it if it is a collection.
    /// Used when the resource itself goes away.
    fn delete_all<'a>(&'a self, path: &'a DavPath) -> LsFuture<'a, Result<(), ()>>;
}

/// What a request is allowed to do to a resource, given the locks that
/// apply and the tokens it submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockPermission {
    /// A lock is in the way.
    Denied,
    /// May change the resource body/properties, but not the mapping
    /// (the parent holds a depth-0 lock).
    ContentsOnly,
    /// Unrestricted.
    Full,
    /// LOCK only: existing locks are all shared, a shared lock may be
    /// added.
    SharedOk,
}

/// The locks that apply to one resource, tagged by where they came
/// from. The three sets are disjoint.
#[derive(Debug, Default)]
pub(crate) struct EffectiveLocks {
    /// Locks on the resource itself.
    pub resource: Vec<DavLock>,
    /// Depth-0 locks on the immediate parent.
    pub depth_zero: Vec<DavLock>,
    /// Depth-infinity locks on any ancestor.
    pub depth_infinity: Vec<DavLock>,
}

impl EffectiveLocks {
    /// Walk the ancestor chain (iteratively, keyed on canonical URLs)
    /// and collect every lock that reaches `path`.
    pub async fn gather(ls: &dyn DavLockSystem, path: &DavPath) -> EffectiveLocks {
        let now = SystemTime::now();
        let mut eff = EffectiveLocks {
            resource: ls.list(path).await,
            ..Default::default()
        };
        // the store purges on read; filter again in case it did not.
        eff.resource.retain(|l| !l.is_expired(now));

        let mut first_parent = true;
        let mut p = path.clone();
        while !p.is_root() {
            p = p.parent();
            for l in ls.list(&p).await {
                if l.is_expired(now) {
                    continue;
                }
                if l.deep {
                    eff.depth_infinity.push(l);
                } else if first_parent {
                    eff.depth_zero.push(l);
                }
            }
            first_parent = false;
        }
        eff
    }

    pub fn all(&self) -> impl Iterator<Item = &DavLock> {
        self.resource
            .iter()
            .chain(self.depth_zero.iter())
            .chain(self.depth_infinity.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.resource.is_empty() && self.depth_zero.is_empty() && self.depth_infinity.is_empty()
    }

    /// The permission decision table.
    pub fn evaluate(
        &self,
        method: DavMethod,
        submitted: &[String],
        principal: Option<&str>,
    ) -> LockPermission {
        if self.is_empty() {
            return LockPermission::Full;
        }
        // a lock we own, with its token submitted, unlocks everything.
        if self.all().any(|l| {
            l.matches_principal(principal) && submitted.iter().any(|t| t == &l.token)
        }) {
            return LockPermission::Full;
        }
        if method != DavMethod::Lock {
            if !self.resource.is_empty() || !self.depth_infinity.is_empty() {
                return LockPermission::Denied;
            }
            if !self.depth_zero.is_empty() {
                return LockPermission::ContentsOnly;
            }
            return LockPermission::Denied;
        }
        // LOCK: scan resource, then depth-infinity, then depth-zero.
        if self
            .resource
            .iter()
            .chain(self.depth_infinity.iter())
            .any(|l| !l.shared)
        {
            return LockPermission::Denied;
        }
        if self.depth_zero.iter().any(|l| !l.shared) {
            return LockPermission::ContentsOnly;
        }
        if self.all().any(|l| l.shared) {
            return LockPermission::SharedOk;
        }
        LockPermission::Denied
    }

    /// The locks a 423 response should point at.
    pub fn conflicting(&self) -> Vec<&DavLock> {
        self.all().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(path: &str, shared: bool, deep: bool, principal: &str, token: &str) -> DavLock {
        DavLock {
            token: token.to_string(),
            path: DavPath::new(path).unwrap(),
            principal: Some(principal.to_string()),
            date: SystemTime::now(),
            timeout: Some(Duration::from_secs(600)),
            shared,
            deep,
            owner: None,
            provisional: false,
        }
    }

    #[test]
    fn test_no_locks_is_full() {
        let eff = EffectiveLocks::default();
        assert_eq!(
            eff.evaluate(DavMethod::Put, &[], Some("alice")),
            LockPermission::Full
        );
    }

    #[test]
    fn test_owned_token_is_full() {
        let eff = EffectiveLocks {
            resource: vec![lock("/f", false, false, "alice", "urn:uuid:1")],
            ..Default::default()
        };
        assert_eq!(
            eff.evaluate(DavMethod::Put, &["urn:uuid:1".to_string()], Some("alice")),
            LockPermission::Full
        );
        // right token, wrong principal.
        assert_eq!(
            eff.evaluate(DavMethod::Put, &["urn:uuid:1".to_string()], Some("bob")),
            LockPermission::Denied
        );
        // right principal, no token.
        assert_eq!(
            eff.evaluate(DavMethod::Put, &[], Some("alice")),
            LockPermission::Denied
        );
    }

    #[test]
    fn test_parent_depth_zero_allows_contents() {
        let eff = EffectiveLocks {
            depth_zero: vec![lock("/c/", false, false, "alice", "urn:uuid:1")],
            ..Default::default()
        };
        assert_eq!(
            eff.evaluate(DavMethod::Put, &[], Some("bob")),
            LockPermission::ContentsOnly
        );
        assert_eq!(
            eff.evaluate(DavMethod::Delete, &[], Some("bob")),
            LockPermission::ContentsOnly
        );
    }

    #[test]
    fn test_lock_method_table() {
        // exclusive on the resource: no new locks at all.
        let eff = EffectiveLocks {
            resource: vec![lock("/f", false, false, "alice", "urn:uuid:1")],
            ..Default::default()
        };
        assert_eq!(
            eff.evaluate(DavMethod::Lock, &[], Some("bob")),
            LockPermission::Denied
        );
        // shared on the resource: another shared lock is fine.
        let eff = EffectiveLocks {
            resource: vec![lock("/f", true, false, "alice", "urn:uuid:1")],
            ..Default::default()
        };
        assert_eq!(
            eff.evaluate(DavMethod::Lock, &[], Some("bob")),
            LockPermission::SharedOk
        );
        // exclusive depth-0 on the parent only restricts the mapping.
        let eff = EffectiveLocks {
            depth_zero: vec![lock("/c/", false, false, "alice", "urn:uuid:1")],
            ..Default::default()
        };
        assert_eq!(
            eff.evaluate(DavMethod::Lock, &[], Some("bob")),
            LockPermission::ContentsOnly
        );
    }

    #[test]
    fn test_views_are_disjoint_in_all() {
        let eff = EffectiveLocks {
            resource: vec![lock("/c/f", true, false, "a", "urn:uuid:1")],
            depth_zero: vec![lock("/c/", true, false, "a", "urn:uuid:2")],
            depth_infinity: vec![lock("/", true, true, "a", "urn:uuid:3")],
        };
        let tokens: Vec<_> = eff.all().map(|l| l.token.as_str()).collect();
        assert_eq!(tokens.len(), 3);
        assert_eq!(
            tokens.iter().collect::<std::collections::HashSet<_>>().len(),
            3
        );
    }
}
