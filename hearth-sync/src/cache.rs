//! Two-tier access-context cache with single-flight lookups.
//!
//! ```text
//! get(ctx) ──► tier 1 (process, LRU, short TTL) ── hit ──► AccessContext
//!                 │ miss
//!                 ▼
//!            in-flight map ── existing flight ──► await shared result
//!                 │ none
//!                 ▼
//!            tier 2 (SharedCache, longer TTL) ── hit ──► fill tier 1
//!                 │ miss
//!                 ▼
//!            AccessLookup (store I/O) ──► fill tier 2 + tier 1
//! ```
//!
//! Concurrent callers for one identity share a single flight, so a cold
//! cache issues exactly one lookup. Failed lookups are handed to every
//! waiter of that flight and nothing is cached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::context::{IdentityKey, RequestContext};
use crate::policy::AccessContext;
use crate::store::{AccessLookup, LookupError};

type Flight = Shared<BoxFuture<'static, Result<AccessContext, LookupError>>>;

/// A registered lookup. Its result is stored only while it is still the
/// registered flight for its key; `invalidate` deregisters it.
struct InFlight {
    id: u64,
    flight: Flight,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared-tier failure. Logged and treated as a miss.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("shared cache error: {0}")]
pub struct SharedCacheError(pub String);

/// Cache tier visible across process instances. Values are opaque bytes.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedCacheError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), SharedCacheError>;
    async fn delete(&self, key: &str) -> Result<(), SharedCacheError>;
}

/// In-memory [`SharedCache`] for single-process deployments and tests.
#[derive(Default)]
pub struct InMemorySharedCache {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.entries)
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedCacheError> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), SharedCacheError> {
        lock(&self.entries).insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SharedCacheError> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub local_hits: u64,
    pub shared_hits: u64,
    pub lookups: u64,
    pub lookup_failures: u64,
    /// Callers that joined a flight started by someone else.
    pub coalesced: u64,
    pub invalidations: u64,
}

#[derive(Default)]
struct AtomicCacheStats {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    lookups: AtomicU64,
    lookup_failures: AtomicU64,
    coalesced: AtomicU64,
    invalidations: AtomicU64,
}

impl AtomicCacheStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

struct LocalEntry {
    value: AccessContext,
    expires_at: Instant,
}

/// Tier 1: insertion order doubles as recency order.
struct LocalTier {
    entries: IndexMap<IdentityKey, LocalEntry>,
    capacity: usize,
    ttl: Duration,
}

impl LocalTier {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn get(&mut self, key: &IdentityKey, now: Instant) -> Option<AccessContext> {
        let entry = self.entries.shift_remove(key)?;
        if entry.expires_at <= now {
            return None;
        }
        let value = entry.value.clone();
        self.entries.insert(*key, entry);
        Some(value)
    }

    fn insert(&mut self, key: IdentityKey, value: AccessContext, now: Instant) {
        self.entries.shift_remove(&key);
        self.entries.insert(
            key,
            LocalEntry {
                value,
                expires_at: now + self.ttl,
            },
        );
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
    }

    fn remove(&mut self, key: &IdentityKey) {
        self.entries.shift_remove(key);
    }
}

struct CacheInner {
    config: CacheConfig,
    local: Mutex<LocalTier>,
    shared: Arc<dyn SharedCache>,
    lookup: Arc<dyn AccessLookup>,
    /// Lock order: `in_flight` before `local`.
    in_flight: Mutex<HashMap<IdentityKey, InFlight>>,
    next_flight: AtomicU64,
    stats: AtomicCacheStats,
}

impl CacheInner {
    fn shared_key(&self, key: &IdentityKey) -> String {
        format!("{}:{key}", self.config.namespace)
    }

    fn is_current(&self, key: &IdentityKey, id: u64) -> bool {
        lock(&self.in_flight).get(key).is_some_and(|f| f.id == id)
    }

    /// Deregister flight `id` and, if it was still current, store `value`
    /// in tier 1. Runs before the flight's result reaches any waiter, so a
    /// later caller never joins a finished flight.
    fn finish(&self, key: IdentityKey, id: u64, value: Option<&AccessContext>) {
        let mut in_flight = lock(&self.in_flight);
        if !in_flight.get(&key).is_some_and(|f| f.id == id) {
            return;
        }
        in_flight.remove(&key);
        if let Some(value) = value {
            lock(&self.local).insert(key, value.clone(), Instant::now());
        }
    }

    async fn fill(
        self: Arc<Self>,
        key: IdentityKey,
        id: u64,
        cid: Uuid,
    ) -> Result<AccessContext, LookupError> {
        let shared_key = self.shared_key(&key);

        match self.shared.get(&shared_key).await {
            Ok(Some(bytes)) => match decode(&bytes) {
                Ok(value) => {
                    AtomicCacheStats::bump(&self.stats.shared_hits);
                    self.finish(key, id, Some(&value));
                    return Ok(value);
                }
                Err(e) => log::warn!("[cid={cid}] discarding undecodable shared entry {shared_key}: {e}"),
            },
            Ok(None) => {}
            Err(e) => log::warn!("[cid={cid}] shared cache read failed for {key}: {e}"),
        }

        AtomicCacheStats::bump(&self.stats.lookups);
        log::debug!("[cid={cid}] deriving access context for {key}");
        let value = match self.lookup.lookup(key).await {
            Ok(value) => value,
            Err(e) => {
                AtomicCacheStats::bump(&self.stats.lookup_failures);
                log::warn!("[cid={cid}] {e}");
                self.finish(key, id, None);
                return Err(e);
            }
        };

        match encode(&value) {
            Ok(bytes) => {
                if let Err(e) = self
                    .shared
                    .set(&shared_key, bytes, self.config.shared_ttl())
                    .await
                {
                    log::warn!("[cid={cid}] shared cache write failed for {key}: {e}");
                }
            }
            Err(e) => log::warn!("[cid={cid}] could not encode access context for {key}: {e}"),
        }

        if !self.is_current(&key, id) {
            // This key was invalidated while the lookup ran; do not leave the old value behind.
            if let Err(e) = self.shared.delete(&shared_key).await {
                log::warn!("[cid={cid}] shared cache delete failed for {key}: {e}");
            }
            return Ok(value);
        }
        self.finish(key, id, Some(&value));
        Ok(value)
    }
}

fn encode(value: &AccessContext) -> Result<Vec<u8>, String> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| e.to_string())
}

fn decode(bytes: &[u8]) -> Result<AccessContext, String> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| e.to_string())
}

/// Per-identity memo of [`AccessContext`] values.
pub struct AccessContextCache {
    inner: Arc<CacheInner>,
}

impl AccessContextCache {
    pub fn new(
        config: CacheConfig,
        shared: Arc<dyn SharedCache>,
        lookup: Arc<dyn AccessLookup>,
    ) -> Self {
        let local = LocalTier::new(config.local_capacity, config.local_ttl());
        Self {
            inner: Arc::new(CacheInner {
                config,
                local: Mutex::new(local),
                shared,
                lookup,
                in_flight: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
                stats: AtomicCacheStats::default(),
            }),
        }
    }

    /// Access context for the caller's identity.
    pub async fn get(&self, ctx: &RequestContext) -> Result<AccessContext, LookupError> {
        let key = ctx.identity().key();
        let cached = lock(&self.inner.local).get(&key, Instant::now());
        if let Some(value) = cached {
            AtomicCacheStats::bump(&self.inner.stats.local_hits);
            return Ok(value);
        }

        let flight = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.get(&key) {
                Some(existing) => {
                    AtomicCacheStats::bump(&self.inner.stats.coalesced);
                    existing.flight.clone()
                }
                None => {
                    let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                    let flight = Arc::clone(&self.inner)
                        .fill(key, id, ctx.correlation_id())
                        .boxed()
                        .shared();
                    in_flight.insert(
                        key,
                        InFlight {
                            id,
                            flight: flight.clone(),
                        },
                    );
                    flight
                }
            }
        };
        flight.await
    }

    /// Drop `key` from both tiers. A never-cached key is a no-op.
    pub async fn invalidate(&self, key: &IdentityKey) {
        {
            let mut in_flight = lock(&self.inner.in_flight);
            in_flight.remove(key);
            lock(&self.inner.local).remove(key);
        }
        AtomicCacheStats::bump(&self.inner.stats.invalidations);

        let shared_key = self.inner.shared_key(key);
        if let Err(e) = self.inner.shared.delete(&shared_key).await {
            log::warn!("shared cache delete failed for {key}: {e}");
        }
        log::debug!("invalidated access context for {key}");
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Identity, IdentityKind};
    use futures_util::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct CountingLookup {
        calls: AtomicUsize,
        fail_first: usize,
        delay: Duration,
        gate: Option<Arc<Notify>>,
    }

    impl CountingLookup {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: 0,
                delay: Duration::from_millis(20),
                gate: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AccessLookup for CountingLookup {
        async fn lookup(&self, key: IdentityKey) -> Result<AccessContext, LookupError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            tokio::time::sleep(self.delay).await;
            if n < self.fail_first {
                return Err(LookupError::Database {
                    key,
                    source: crate::store::DatabaseError::new("timeout"),
                });
            }
            Ok(AccessContext::User {
                org_ids: [key.id].into_iter().collect(),
            })
        }
    }

    fn user_ctx() -> RequestContext {
        RequestContext::new(Identity::user(Uuid::new_v4(), []))
    }

    fn cache_with(lookup: Arc<CountingLookup>, config: CacheConfig) -> AccessContextCache {
        AccessContextCache::new(config, Arc::new(InMemorySharedCache::new()), lookup)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_cold_gets_share_one_lookup() {
        let lookup = Arc::new(CountingLookup::new());
        let cache = cache_with(lookup.clone(), CacheConfig::default());
        let ctx = user_ctx();

        let results = join_all((0..32).map(|_| cache.get(&ctx))).await;

        assert_eq!(lookup.calls(), 1);
        assert!(results.iter().all(|r| r.as_ref().ok() == results[0].as_ref().ok()));
        assert_eq!(cache.stats().coalesced, 31);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_every_waiter_and_is_not_cached() {
        let lookup = Arc::new(CountingLookup {
            fail_first: 1,
            ..CountingLookup::new()
        });
        let cache = cache_with(lookup.clone(), CacheConfig::default());
        let ctx = user_ctx();

        let results = join_all((0..8).map(|_| cache.get(&ctx))).await;
        assert!(results.iter().all(|r| matches!(r, Err(LookupError::Database { .. }))));
        assert_eq!(lookup.calls(), 1);

        assert!(cache.get(&ctx).await.is_ok());
        assert_eq!(lookup.calls(), 2);
        assert_eq!(cache.stats().lookup_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_expiry_falls_back_to_shared_tier() {
        let lookup = Arc::new(CountingLookup::new());
        let cache = cache_with(lookup.clone(), CacheConfig::default());
        let ctx = user_ctx();

        cache.get(&ctx).await.unwrap();
        cache.get(&ctx).await.unwrap();
        assert_eq!(cache.stats().local_hits, 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        cache.get(&ctx).await.unwrap();
        assert_eq!(cache.stats().shared_hits, 1);
        assert_eq!(lookup.calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        cache.get(&ctx).await.unwrap();
        assert_eq!(lookup.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_evicts_least_recent() {
        let lookup = Arc::new(CountingLookup::new());
        let config = CacheConfig {
            local_capacity: 2,
            ..CacheConfig::default()
        };
        let cache = cache_with(lookup.clone(), config);
        let (a, b, c) = (user_ctx(), user_ctx(), user_ctx());

        cache.get(&a).await.unwrap();
        cache.get(&b).await.unwrap();
        cache.get(&a).await.unwrap(); // a is now most recent
        cache.get(&c).await.unwrap(); // evicts b

        cache.get(&a).await.unwrap();
        assert_eq!(cache.stats().local_hits, 2);
        cache.get(&b).await.unwrap();
        assert_eq!(cache.stats().shared_hits, 1);
        assert_eq!(lookup.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_fresh_lookup() {
        let lookup = Arc::new(CountingLookup::new());
        let cache = cache_with(lookup.clone(), CacheConfig::default());
        let ctx = user_ctx();

        cache.get(&ctx).await.unwrap();
        cache.invalidate(&ctx.identity().key()).await;
        cache.get(&ctx).await.unwrap();

        assert_eq!(lookup.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_unknown_key_is_noop() {
        let lookup = Arc::new(CountingLookup::new());
        let cache = cache_with(lookup.clone(), CacheConfig::default());
        cache
            .invalidate(&IdentityKey::new(IdentityKind::Bot, Uuid::new_v4()))
            .await;
        assert_eq!(cache.stats().invalidations, 1);
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_during_flight_is_not_cached() {
        let gate = Arc::new(Notify::new());
        let lookup = Arc::new(CountingLookup {
            gate: Some(gate.clone()),
            ..CountingLookup::new()
        });
        let cache = Arc::new(cache_with(lookup.clone(), CacheConfig::default()));
        let ctx = user_ctx();

        let pending = {
            let cache = cache.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { cache.get(&ctx).await })
        };
        tokio::task::yield_now().await;
        cache.invalidate(&ctx.identity().key()).await;
        gate.notify_one();
        assert!(pending.await.unwrap().is_ok());

        gate.notify_one();
        cache.get(&ctx).await.unwrap();
        assert_eq!(lookup.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_invalidate_keeps_flight_result() {
        let gate = Arc::new(Notify::new());
        let lookup = Arc::new(CountingLookup {
            gate: Some(gate.clone()),
            ..CountingLookup::new()
        });
        let shared = Arc::new(InMemorySharedCache::new());
        let cache = Arc::new(AccessContextCache::new(
            CacheConfig::default(),
            shared.clone(),
            lookup.clone(),
        ));
        let user = user_ctx();

        let pending = {
            let cache = cache.clone();
            let user = user.clone();
            tokio::spawn(async move { cache.get(&user).await })
        };
        tokio::task::yield_now().await;
        cache
            .invalidate(&IdentityKey::new(IdentityKind::Bot, Uuid::new_v4()))
            .await;
        gate.notify_one();
        assert!(pending.await.unwrap().is_ok());

        cache.get(&user).await.unwrap();
        assert_eq!(lookup.calls(), 1);
        assert_eq!(cache.stats().local_hits, 1);
        assert_eq!(shared.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_flight_is_deregistered_before_waiters_resume() {
        let lookup = Arc::new(CountingLookup {
            fail_first: 1,
            ..CountingLookup::new()
        });
        let cache = cache_with(lookup.clone(), CacheConfig::default());
        let ctx = user_ctx();
        let key = ctx.identity().key();

        let flight = Arc::clone(&cache.inner)
            .fill(key, 7, ctx.correlation_id())
            .boxed()
            .shared();
        lock(&cache.inner.in_flight).insert(
            key,
            InFlight {
                id: 7,
                flight: flight.clone(),
            },
        );

        assert!(flight.await.is_err());
        assert!(lock(&cache.inner.in_flight).is_empty());

        assert!(cache.get(&ctx).await.is_ok());
        assert_eq!(lookup.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_tier_is_visible_across_instances() {
        let shared = Arc::new(InMemorySharedCache::new());
        let lookup = Arc::new(CountingLookup::new());
        let first = AccessContextCache::new(CacheConfig::default(), shared.clone(), lookup.clone());
        let second = AccessContextCache::new(CacheConfig::default(), shared.clone(), lookup.clone());
        let ctx = user_ctx();

        let a = first.get(&ctx).await.unwrap();
        let b = second.get(&ctx).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(lookup.calls(), 1);
        assert_eq!(second.stats().shared_hits, 1);
        assert_eq!(shared.len(), 1);
    }

    #[test]
    fn test_access_context_bincode_roundtrip() {
        let value = AccessContext::Bot {
            channel_ids: [Uuid::new_v4(), Uuid::new_v4()].into_iter().collect(),
        };
        assert_eq!(decode(&encode(&value).unwrap()).unwrap(), value);
    }
}
