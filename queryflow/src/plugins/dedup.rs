//! Request deduplication and response caching.
//!
//! Collapses concurrent identical requests into a single real fetch: the
//! first request for a key registers a deferred entry, followers await it,
//! and the owner fans its response out through the error channel (as the
//! internal duplicate signal) so every follower resolves with the same
//! payload. A persisted cache short-circuits later calls entirely, and a
//! staleness timer bounds how long followers can be held: when it fires,
//! still-pending followers are released to fetch for themselves.

use crate::chain::{QueryContext, QueryStage};
use crate::deferred::DeferredValue;
use crate::errors::QueryError;
use crate::plugins::{ErrorDisposition, KeySpec, QueryPlugin};
use crate::storage::{CacheStore, MemoryStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default TTL for persisted responses.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(15 * 60);

/// Default staleness window for in-flight dedup entries.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(10);

/// Per-call configuration for dedup/caching.
#[derive(Clone)]
pub struct CacheConfig {
    /// How the cache key is obtained.
    pub key: KeySpec,
    /// TTL for persisting responses; `None` disables persistence (dedup of
    /// concurrent calls still applies).
    pub cache_time: Option<Duration>,
    /// How long followers may be held on the first in-flight request before
    /// being released to fetch for themselves.
    pub stale_time: Duration,
    /// Store override for this call; the plugin's own store is used when
    /// absent.
    pub store: Option<Arc<dyn CacheStore>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key: KeySpec::ContentHash,
            cache_time: Some(DEFAULT_CACHE_TIME),
            stale_time: DEFAULT_STALE_TIME,
            store: None,
        }
    }
}

impl CacheConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key policy.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<KeySpec>) -> Self {
        self.key = key.into();
        self
    }

    /// Sets the persisted-response TTL.
    #[must_use]
    pub fn with_cache_time(mut self, ttl: Duration) -> Self {
        self.cache_time = Some(ttl);
        self
    }

    /// Disables response persistence, keeping in-flight dedup only.
    #[must_use]
    pub fn without_persistence(mut self) -> Self {
        self.cache_time = None;
        self
    }

    /// Sets the staleness window.
    #[must_use]
    pub fn with_stale_time(mut self, window: Duration) -> Self {
        self.stale_time = window;
        self
    }

    /// Overrides the cache store for this call.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("key", &self.key)
            .field("cache_time", &self.cache_time)
            .field("stale_time", &self.stale_time)
            .field("store", &self.store.as_ref().map(|_| ".."))
            .finish()
    }
}

type DedupEntry = Arc<DeferredValue<Value, QueryError>>;

/// Plugin collapsing concurrent identical requests and caching responses.
///
/// In-flight entries are shared by every call going through the same plugin
/// instance; register one `Arc` on each chain that should share them.
pub struct DedupCache {
    entries: Arc<Mutex<HashMap<String, DedupEntry>>>,
    store: Arc<dyn CacheStore>,
}

impl DedupCache {
    /// Creates a dedup/cache plugin backed by an in-process [`MemoryStore`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// Creates a dedup/cache plugin backed by the given store.
    #[must_use]
    pub fn with_store(store: Arc<dyn CacheStore>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            store,
        }
    }

    /// Number of registered in-flight entries (settled ones included until
    /// their staleness timer removes them).
    pub fn pending(&self) -> usize {
        self.entries.lock().len()
    }

    fn store_for(&self, config: &CacheConfig) -> Arc<dyn CacheStore> {
        config
            .store
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.store))
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryPlugin for DedupCache {
    async fn on_query_before(
        &self,
        params: Value,
        ctx: &QueryContext,
    ) -> Result<Option<Value>, QueryError> {
        let Some(config) = ctx.options().cache.as_ref() else {
            return Ok(None);
        };
        let key = ctx.cache_key(&config.key, &params).to_owned();

        if let Some(cached) = self.store_for(config).get(&key).await {
            debug!(query_id = %ctx.query_id(), key = %key, "cache hit");
            // Routed back into a success by this plugin's error-hook.
            return Err(QueryError::Duplicate(cached));
        }

        let (entry, owner) = {
            let mut entries = self.entries.lock();
            match entries.get(&key) {
                Some(entry) => (Arc::clone(entry), false),
                None => {
                    let entry: DedupEntry =
                        Arc::new(DeferredValue::new().with_default(params.clone()));
                    entries.insert(key.clone(), Arc::clone(&entry));
                    (entry, true)
                }
            }
        };

        if !owner {
            debug!(query_id = %ctx.query_id(), key = %key, "joining in-flight request");
            return match entry.result().await {
                Ok(seeded) => Ok(seeded),
                Err(Some(error)) => Err(error),
                Err(None) => Ok(None),
            };
        }

        ctx.set_dedup_entry(Arc::clone(&entry));

        let entries = Arc::clone(&self.entries);
        let stale_time = config.stale_time;
        tokio::spawn(async move {
            tokio::time::sleep(stale_time).await;
            let expired = entries.lock().remove(&key);
            if let Some(entry) = expired {
                // A still-pending entry resolves bare: held followers fall
                // through to their own real fetch rather than receiving a
                // value.
                entry.success(None);
            }
        });

        Ok(None)
    }

    async fn on_queryed(
        &self,
        response: Value,
        ctx: &QueryContext,
    ) -> Result<Option<Value>, QueryError> {
        let Some(config) = ctx.options().cache.as_ref() else {
            return Ok(None);
        };
        if let Some(entry) = ctx.dedup_entry() {
            // Fan the fresh response out to every follower through the error
            // channel; their error-hooks convert it back into a success.
            entry.fail(Some(QueryError::Duplicate(response.clone())));

            if let Some(ttl) = config.cache_time {
                if let Some(key) = ctx.cache_key_resolved() {
                    self.store_for(config).set(key, response, Some(ttl)).await;
                    debug!(query_id = %ctx.query_id(), key = %key, "response cached");
                }
            }
        }
        Ok(None)
    }

    async fn on_error(
        &self,
        error: &QueryError,
        ctx: &QueryContext,
        _stage: QueryStage,
    ) -> ErrorDisposition {
        if ctx.options().cache.is_none() {
            return ErrorDisposition::Continue;
        }
        if let QueryError::Duplicate(payload) = error {
            return ErrorDisposition::Recover(payload.clone());
        }
        if let Some(entry) = ctx.dedup_entry() {
            // The owning request failed; release followers to fetch for
            // themselves and let the error propagate.
            entry.success(None);
            debug!(query_id = %ctx.query_id(), "owner failed, followers released");
        }
        ErrorDisposition::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{QueryChain, QueryOptions};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fetcher returning `{"n": <call number>}`, so tests can tell which
    /// fetch produced a response.
    fn counting_fetcher(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl Fn(Value) -> futures::future::BoxFuture<'static, Result<Value, Value>> {
        let calls = Arc::clone(calls);
        move |_params: Value| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                Ok(json!({"n": n}))
            })
        }
    }

    fn cache_options(key: &str) -> QueryOptions {
        QueryOptions::new().with_cache(CacheConfig::new().with_key(key))
    }

    #[tokio::test]
    async fn concurrent_identical_requests_share_one_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = Arc::new(
            QueryChain::new(counting_fetcher(&calls, Duration::from_millis(30)))
                .with_plugin(Arc::new(DedupCache::new())),
        );

        let mut handles = Vec::new();
        for _ in 0..3 {
            let chain = Arc::clone(&chain);
            handles.push(tokio::spawn(async move {
                chain.query(json!({"id": 1}), cache_options("k")).await
            }));
            // Let the first spawn claim ownership before the others join.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut responses = Vec::new();
        for handle in handles {
            responses.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(responses, vec![json!({"n": 1}); 3]);
    }

    #[tokio::test]
    async fn later_call_is_served_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = QueryChain::new(counting_fetcher(&calls, Duration::from_millis(1)))
            .with_plugin(Arc::new(DedupCache::new()));

        let first = chain.query(json!({"id": 1}), cache_options("k")).await;
        let second = chain.query(json!({"id": 1}), cache_options("k")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cache_hit_never_invokes_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        store.set("k", json!("warm"), None).await;

        let chain = QueryChain::new(counting_fetcher(&calls, Duration::from_millis(1)))
            .with_plugin(Arc::new(DedupCache::with_store(store)));

        let out = chain.query(json!({"id": 1}), cache_options("k")).await;
        assert_eq!(out, Ok(json!("warm")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_entry_forces_a_fresh_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = Arc::new(
            QueryChain::new(counting_fetcher(&calls, Duration::from_millis(120)))
                .with_plugin(Arc::new(DedupCache::new())),
        );

        let options = || {
            QueryOptions::new().with_cache(
                CacheConfig::new()
                    .with_key("k")
                    .with_stale_time(Duration::from_millis(40)),
            )
        };

        let early = {
            let chain = Arc::clone(&chain);
            let options = options();
            tokio::spawn(async move { chain.query(json!({"id": 1}), options).await })
        };
        // Arrive after the staleness window has expired the entry but while
        // the first fetch is still outstanding.
        tokio::time::sleep(Duration::from_millis(70)).await;
        let late = chain.query(json!({"id": 1}), options()).await;

        assert_eq!(early.await.unwrap(), Ok(json!({"n": 1})));
        assert_eq!(late, Ok(json!({"n": 2})));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn owner_error_releases_followers_to_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = {
            let calls = Arc::clone(&calls);
            move |_params: Value| {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    if n == 1 {
                        Err(json!("first call breaks"))
                    } else {
                        Ok(json!({"n": n}))
                    }
                }
            }
        };
        let chain = Arc::new(QueryChain::new(fetcher).with_plugin(Arc::new(DedupCache::new())));

        let owner = {
            let chain = Arc::clone(&chain);
            tokio::spawn(async move { chain.query(json!({"id": 1}), cache_options("k")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = {
            let chain = Arc::clone(&chain);
            tokio::spawn(async move { chain.query(json!({"id": 1}), cache_options("k")).await })
        };

        let owner_out = owner.await.unwrap();
        let follower_out = follower.await.unwrap();

        assert!(matches!(owner_out, Err(QueryError::Dispatch(_))));
        assert_eq!(follower_out, Ok(json!({"n": 2})));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn passthrough_when_not_requested() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = QueryChain::new(counting_fetcher(&calls, Duration::from_millis(1)))
            .with_plugin(Arc::new(DedupCache::new()));

        let first = chain.query(json!({"id": 1}), QueryOptions::new()).await;
        let second = chain.query(json!({"id": 1}), QueryOptions::new()).await;

        assert!(first.is_ok());
        assert!(second.is_ok());
        // No dedup without a cache section: both calls really fetched.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
