//! The two-tier access-token cache (C5): an in-process L1 in front of a
//! shared L2, with a distributed lock guarding cold-cache misses so a burst
//! of identical requests mints one upstream token, not one per request.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use broker_std::backoff;

use crate::error::BrokerError;

/// A minted access token, as it's minted by a [`crate::provider::Provider`]
/// and as it's cached.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    /// Unix ms at which this token stops being usable.
    pub expires_at: u64,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        now_ms() >= self.expires_at
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}

/// The cache key: notably `owner` and `scope` only, not `target`. Two
/// sessions with the same owner and scope but different targets share one
/// cached token. See `DESIGN.md` open question on this.
pub fn fingerprint(owner: &str, scope: &str) -> String {
    format!("access-token-{owner}-{scope}")
}

/// `ACCESS_TOKEN_LOCAL_CACHE_TIME` / `ACCESS_TOKEN_REMOTE_CACHE_TIME`: cache
/// freshness windows, independent of (and generally shorter than) the
/// token's own `expires_at`.
#[derive(Clone, Copy, Debug)]
pub struct CacheTtls {
    pub local_secs: u64,
    pub remote_secs: u64,
}

/// A cached token plus the wall-clock time it stops being served from cache,
/// distinct from the token's own (usually longer) `expires_at`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry {
    pub token: AccessToken,
    pub cached_until: u64,
}

impl CacheEntry {
    fn new(token: AccessToken, ttl_secs: u64) -> Self {
        Self {
            cached_until: now_ms() + ttl_secs * 1_000,
            token,
        }
    }

    fn is_fresh(&self) -> bool {
        now_ms() < self.cached_until && !self.token.is_expired()
    }
}

#[derive(Clone, Debug, Error)]
pub enum CacheError {
    #[error("could not acquire lock for `{0}` before the retry budget was exhausted")]
    LockTimeout(String),
    #[error("cache backend error: {0}")]
    Backend(String),
    /// A handled [`BrokerError`] raised by the `mint` closure, e.g. a
    /// provider reporting that the caller's authorization has expired. Kept
    /// distinct from `Backend` so callers can still map it to its real RPC
    /// status instead of the generic "Server error".
    #[error(transparent)]
    Mint(#[from] BrokerError),
}

/// The shared (L2) half of the cache: a remote key-value store plus a
/// cooperative lock keyed by the same fingerprint, so only one replica mints
/// a fresh token on a cache miss. Implementations are responsible for
/// encrypting the stored value under the access-token-cache KMS key; the
/// in-memory stand-in below stores plaintext since it never leaves the
/// process.
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError>;
    /// Attempt to acquire the named lock. Returns `true` if acquired.
    /// Implementations should attach a lease so a crashed holder doesn't
    /// wedge the lock forever.
    async fn try_acquire_lock(&self, key: &str) -> Result<bool, CacheError>;
    async fn release_lock(&self, key: &str) -> Result<(), CacheError>;
}

const LOCK_RETRY_BUDGET: usize = 20;

/// Look up a cached, unexpired access token by `(owner, scope)`, checking
/// the fast in-process L1 map first and falling through to the shared L2
/// [`Cache`] behind a distributed lock on miss.
///
/// `mint` is called at most once per process-wide stampede: the first
/// caller to win the lock mints and populates both tiers; every other
/// concurrent caller for the same fingerprint polls L2 with backoff until
/// the winner publishes, instead of minting redundant tokens upstream.
#[instrument(skip(l1, l2, mint), fields(fingerprint = %fingerprint(owner, scope)))]
pub async fn get_or_mint<F, Fut>(
    l1: &InMemoryCache,
    l2: &dyn Cache,
    owner: &str,
    scope: &str,
    ttls: CacheTtls,
    mint: F,
) -> Result<AccessToken, CacheError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<AccessToken, CacheError>>,
{
    let key = fingerprint(owner, scope);

    if let Some(entry) = l1.get_fresh(&key) {
        return Ok(entry.token);
    }
    if let Some(entry) = l2.get(&key).await?.filter(CacheEntry::is_fresh) {
        l1.set(&key, entry.clone());
        return Ok(entry.token);
    }

    let mut backoffs = backoff::get_backoff_iter();
    for _ in 0..LOCK_RETRY_BUDGET {
        if l2.try_acquire_lock(&key).await? {
            // Double-checked: another replica may have published while we
            // were waiting for the lock.
            let result = match l2.get(&key).await?.filter(CacheEntry::is_fresh) {
                Some(entry) => Ok(entry),
                None => mint().await.map(|token| CacheEntry::new(token, ttls.remote_secs)),
            };
            if let Ok(entry) = &result {
                l2.set(&key, entry).await?;
                l1.set(&key, CacheEntry::new(entry.token.clone(), ttls.local_secs));
            }
            l2.release_lock(&key).await?;
            return result.map(|entry| entry.token);
        }

        if let Some(entry) = l2.get(&key).await?.filter(CacheEntry::is_fresh) {
            l1.set(&key, entry.clone());
            return Ok(entry.token);
        }

        tokio::time::sleep(backoffs.next().expect("backoff iterator is infinite")).await;
    }

    Err(CacheError::LockTimeout(key))
}

/// The in-process L1: a plain map, never itself locked against a stampede
/// (that's L2's job) since it only ever serves a cache *hit*.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_fresh(&self, key: &str) -> Option<CacheEntry> {
        let entries = self.entries.lock().expect("L1 cache mutex poisoned");
        entries.get(key).filter(|e| e.is_fresh()).cloned()
    }

    pub fn set(&self, key: &str, entry: CacheEntry) {
        self.entries
            .lock()
            .expect("L1 cache mutex poisoned")
            .insert(key.to_owned(), entry);
    }
}

/// An in-memory [`Cache`] (L2 stand-in), suitable for local development and
/// the integration test suite. The lock is a simple boolean per key with no
/// lease, since nothing holds it across an await point longer than a single
/// process's mint call in tests.
#[derive(Default)]
pub struct InMemoryL2Cache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    locks: Mutex<HashMap<String, ()>>,
}

impl InMemoryL2Cache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Cache for InMemoryL2Cache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .entries
            .lock()
            .expect("L2 cache mutex poisoned")
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        self.entries
            .lock()
            .expect("L2 cache mutex poisoned")
            .insert(key.to_owned(), entry.clone());
        Ok(())
    }

    async fn try_acquire_lock(&self, key: &str) -> Result<bool, CacheError> {
        let mut locks = self.locks.lock().expect("L2 lock mutex poisoned");
        if locks.contains_key(key) {
            Ok(false)
        } else {
            locks.insert(key.to_owned(), ());
            Ok(true)
        }
    }

    async fn release_lock(&self, key: &str) -> Result<(), CacheError> {
        self.locks
            .lock()
            .expect("L2 lock mutex poisoned")
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn token(ttl_ms: u64) -> AccessToken {
        AccessToken {
            value: "tok".to_owned(),
            expires_at: now_ms() + ttl_ms,
        }
    }

    const TTLS: CacheTtls = CacheTtls {
        local_secs: 60,
        remote_secs: 1_800,
    };

    #[tokio::test]
    async fn mints_on_cold_cache_and_caches_result() {
        let l1 = InMemoryCache::new();
        let l2 = InMemoryL2Cache::new();
        let calls = AtomicUsize::new(0);

        let result = get_or_mint(&l1, &l2, "alice", "scope", TTLS, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(token(60_000))
        })
        .await
        .unwrap();
        assert_eq!(result.value, "tok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Second call is served from L1 without minting again.
        let result = get_or_mint(&l1, &l2, "alice", "scope", TTLS, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(token(60_000))
        })
        .await
        .unwrap();
        assert_eq!(result.value, "tok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_scopes_are_independent() {
        let l1 = InMemoryCache::new();
        let l2 = InMemoryL2Cache::new();

        get_or_mint(&l1, &l2, "alice", "scope-a", TTLS, || async {
            Ok(token(60_000))
        })
        .await
        .unwrap();
        let l1_hit = l1.get_fresh(&fingerprint("alice", "scope-b"));
        assert!(l1_hit.is_none());
    }

    #[tokio::test]
    async fn local_ttl_expiry_forces_a_remote_refetch() {
        let l1 = InMemoryCache::new();
        let l2 = InMemoryL2Cache::new();
        let key = fingerprint("alice", "scope");

        // Token itself is long-lived, but the local cache TTL is 0s, so
        // every lookup must fall through L1 to L2 (not re-mint, since L2 is
        // still fresh).
        let ttls = CacheTtls {
            local_secs: 0,
            remote_secs: 1_800,
        };
        let calls = AtomicUsize::new(0);

        get_or_mint(&l1, &l2, "alice", "scope", ttls, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(token(60_000))
        })
        .await
        .unwrap();
        assert!(l1.get_fresh(&key).is_none());

        get_or_mint(&l1, &l2, "alice", "scope", ttls, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(token(60_000))
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
