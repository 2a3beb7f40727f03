//! Caller identity and canvas authorization.
//!
//! An [`IdentityProvider`] turns an opaque credential into the set of canvases
//! the caller may edit and a user id to credit edits to. Providers that call
//! out to a remote service should be wrapped in [`CachedIdentity`].

use crate::types::{CanvasId, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Identity lookup errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// The credential is invalid or does not grant access.
    #[error("Unauthorized")]
    Unauthorized,

    /// The identity service is throttling us.
    #[error("Rate limited by identity service")]
    RateLimited,

    /// The identity service failed in some other way.
    #[error("Identity service error: {0}")]
    Upstream(String),
}

/// Resolves credentials to canvases and users.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Canvases the credential may edit.
    async fn caller_canvases(&self, credential: &str) -> Result<HashSet<CanvasId>, IdentityError>;

    /// User id to credit edits to.
    async fn caller_id(&self, credential: &str) -> Result<UserId, IdentityError>;

    /// Check access to `canvas` and resolve the caller.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Unauthorized`] if the credential does not grant
    /// access to `canvas`, or any error of the underlying lookups.
    async fn authorize(&self, credential: &str, canvas: CanvasId) -> Result<UserId, IdentityError> {
        if !self.caller_canvases(credential).await?.contains(&canvas) {
            return Err(IdentityError::Unauthorized);
        }
        self.caller_id(credential).await
    }
}

/// How long [`CachedIdentity`] remembers answers.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub canvases_ttl: Duration,
    pub user_ttl: Duration,
    /// Applies to credentials the provider rejected.
    pub denied_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            canvases_ttl: Duration::from_secs(5 * 60),
            user_ttl: Duration::from_secs(60 * 60),
            denied_ttl: Duration::from_secs(60 * 60),
        }
    }
}

struct Cached<T> {
    /// `None` records a rejected credential.
    value: Option<T>,
    expires_at: Instant,
}

/// Caching wrapper around another provider.
///
/// Successful lookups and rejections are remembered; rate limits and other
/// upstream failures are not.
pub struct CachedIdentity<P> {
    inner: P,
    canvases: DashMap<String, Cached<HashSet<CanvasId>>>,
    users: DashMap<String, Cached<UserId>>,
    policy: CachePolicy,
}

impl<P: IdentityProvider> CachedIdentity<P> {
    #[must_use]
    pub fn new(inner: P) -> Self {
        Self::with_policy(inner, CachePolicy::default())
    }

    #[must_use]
    pub fn with_policy(inner: P, policy: CachePolicy) -> Self {
        Self {
            inner,
            canvases: DashMap::new(),
            users: DashMap::new(),
            policy,
        }
    }

    #[cfg(test)]
    fn inner(&self) -> &P {
        &self.inner
    }

    /// Number of cached entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.canvases.len() + self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.len();
        self.canvases.retain(|_, e| e.expires_at > now);
        self.users.retain(|_, e| e.expires_at > now);
        let purged = before.saturating_sub(self.len());
        if purged > 0 {
            debug!(purged, "Purged expired identity cache entries");
        }
        purged
    }
}

fn lookup<T: Clone>(
    map: &DashMap<String, Cached<T>>,
    credential: &str,
) -> Option<Result<T, IdentityError>> {
    let now = Instant::now();
    let hit = map
        .get(credential)
        .filter(|e| e.expires_at > now)
        .map(|e| e.value.clone().ok_or(IdentityError::Unauthorized));

    if hit.is_none() {
        map.remove_if(credential, |_, e| e.expires_at <= now);
    }
    hit
}

fn remember<T: Clone>(
    map: &DashMap<String, Cached<T>>,
    credential: &str,
    result: &Result<T, IdentityError>,
    ttl: Duration,
    denied_ttl: Duration,
) {
    let (value, ttl) = match result {
        Ok(value) => (Some(value.clone()), ttl),
        Err(IdentityError::Unauthorized) => (None, denied_ttl),
        Err(_) => return,
    };

    map.insert(
        credential.to_string(),
        Cached {
            value,
            expires_at: Instant::now() + ttl,
        },
    );
}

#[async_trait]
impl<P: IdentityProvider> IdentityProvider for CachedIdentity<P> {
    async fn caller_canvases(&self, credential: &str) -> Result<HashSet<CanvasId>, IdentityError> {
        if let Some(hit) = lookup(&self.canvases, credential) {
            trace!("Identity cache hit for canvases");
            return hit;
        }

        let result = self.inner.caller_canvases(credential).await;
        remember(
            &self.canvases,
            credential,
            &result,
            self.policy.canvases_ttl,
            self.policy.denied_ttl,
        );
        result
    }

    async fn caller_id(&self, credential: &str) -> Result<UserId, IdentityError> {
        if let Some(hit) = lookup(&self.users, credential) {
            trace!("Identity cache hit for user");
            return hit;
        }

        let result = self.inner.caller_id(credential).await;
        remember(
            &self.users,
            credential,
            &result,
            self.policy.user_ttl,
            self.policy.denied_ttl,
        );
        result
    }
}

/// A user and the canvases they may edit.
#[derive(Debug, Clone)]
pub struct Grant {
    pub user: UserId,
    pub canvases: HashSet<CanvasId>,
}

/// Fixed credential table, for development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    grants: HashMap<String, Grant>,
}

impl StaticIdentity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `credential` edit `canvases` as `user`.
    #[must_use]
    pub fn with_grant(
        mut self,
        credential: impl Into<String>,
        user: UserId,
        canvases: impl IntoIterator<Item = CanvasId>,
    ) -> Self {
        self.grants.insert(
            credential.into(),
            Grant {
                user,
                canvases: canvases.into_iter().collect(),
            },
        );
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn caller_canvases(&self, credential: &str) -> Result<HashSet<CanvasId>, IdentityError> {
        self.grants
            .get(credential)
            .map(|g| g.canvases.clone())
            .ok_or(IdentityError::Unauthorized)
    }

    async fn caller_id(&self, credential: &str) -> Result<UserId, IdentityError> {
        self.grants
            .get(credential)
            .map(|g| g.user)
            .ok_or(IdentityError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Provider with a scripted answer that counts upstream calls.
    struct Scripted {
        answer: Mutex<Result<UserId, IdentityError>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answer: Result<UserId, IdentityError>) -> Self {
            Self {
                answer: Mutex::new(answer),
                calls: AtomicUsize::new(0),
            }
        }

        fn answer(&self) -> Result<UserId, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.lock().unwrap().clone()
        }

        fn set(&self, answer: Result<UserId, IdentityError>) {
            *self.answer.lock().unwrap() = answer;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdentityProvider for Scripted {
        async fn caller_canvases(&self, _: &str) -> Result<HashSet<CanvasId>, IdentityError> {
            self.answer().map(|_| HashSet::from([CanvasId(1)]))
        }

        async fn caller_id(&self, _: &str) -> Result<UserId, IdentityError> {
            self.answer()
        }
    }

    fn user(id: u64) -> UserId {
        UserId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_static_identity() {
        let identity = StaticIdentity::new().with_grant("tok", user(5), [CanvasId(1), CanvasId(2)]);

        assert_eq!(identity.authorize("tok", CanvasId(2)).await, Ok(user(5)));
        assert_eq!(
            identity.authorize("tok", CanvasId(3)).await,
            Err(IdentityError::Unauthorized)
        );
        assert_eq!(
            identity.authorize("other", CanvasId(1)).await,
            Err(IdentityError::Unauthorized)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hits_until_expiry() {
        let cached = CachedIdentity::new(Scripted::new(Ok(user(9))));

        assert_eq!(cached.authorize("tok", CanvasId(1)).await, Ok(user(9)));
        assert_eq!(cached.authorize("tok", CanvasId(1)).await, Ok(user(9)));
        assert_eq!(cached.inner().calls(), 2);

        // Canvas list expires after five minutes, the user id after an hour.
        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        assert_eq!(cached.authorize("tok", CanvasId(1)).await, Ok(user(9)));
        assert_eq!(cached.inner().calls(), 3);

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        assert_eq!(cached.authorize("tok", CanvasId(1)).await, Ok(user(9)));
        assert_eq!(cached.inner().calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_is_cached() {
        let cached = CachedIdentity::new(Scripted::new(Err(IdentityError::Unauthorized)));

        for _ in 0..3 {
            assert_eq!(
                cached.caller_canvases("bad").await,
                Err(IdentityError::Unauthorized)
            );
        }
        assert_eq!(cached.inner().calls(), 1);

        cached.inner().set(Ok(user(1)));
        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        assert!(cached.caller_canvases("bad").await.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_is_not_cached() {
        let cached = CachedIdentity::new(Scripted::new(Err(IdentityError::RateLimited)));

        assert_eq!(cached.caller_id("tok").await, Err(IdentityError::RateLimited));
        cached.inner().set(Ok(user(2)));
        assert_eq!(cached.caller_id("tok").await, Ok(user(2)));
        assert_eq!(cached.inner().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cached = CachedIdentity::new(Scripted::new(Ok(user(4))));
        cached.authorize("a", CanvasId(1)).await.unwrap();
        cached.authorize("b", CanvasId(1)).await.unwrap();
        assert_eq!(cached.len(), 4);

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert_eq!(cached.purge_expired(), 2);
        assert_eq!(cached.len(), 2);
    }
}
