//! Per-query options and threaded context.

use crate::deferred::DeferredValue;
use crate::errors::QueryError;
use crate::plugins::{CacheConfig, ConcurrentConfig, KeySpec, RetryConfig};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Per-call configuration, one optional section per built-in plugin.
///
/// An absent section disables the corresponding plugin for this call; its
/// hooks pass params, responses, and errors through untouched.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Concurrency limiting, see [`ConcurrentConfig`].
    pub concurrent: Option<ConcurrentConfig>,
    /// Request dedup and response caching, see [`CacheConfig`].
    pub cache: Option<CacheConfig>,
    /// Error retry, see [`RetryConfig`].
    pub error_retry: Option<RetryConfig>,
}

impl QueryOptions {
    /// Creates options with every plugin disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables concurrency limiting for this call.
    #[must_use]
    pub fn with_concurrent(mut self, config: ConcurrentConfig) -> Self {
        self.concurrent = Some(config);
        self
    }

    /// Enables dedup/caching for this call.
    #[must_use]
    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Enables error retry for this call.
    #[must_use]
    pub fn with_error_retry(mut self, config: RetryConfig) -> Self {
        self.error_retry = Some(config);
        self
    }
}

/// State threaded to every hook of one logical query.
///
/// Created once per [`crate::chain::QueryChain::query`] call and reused
/// across restarts of the same logical query, so per-query bookkeeping (the
/// resolved keys, the retry attempt counter) survives each pass through the
/// pipeline.
pub struct QueryContext {
    query_id: Uuid,
    params: Value,
    options: QueryOptions,
    concurrent_key: OnceLock<String>,
    cache_key: OnceLock<String>,
    dedup_entry: Mutex<Option<Arc<DeferredValue<Value, QueryError>>>>,
    attempts: AtomicU32,
}

impl QueryContext {
    /// Creates the context for one logical query.
    #[must_use]
    pub fn new(params: Value, options: QueryOptions) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            params,
            options,
            concurrent_key: OnceLock::new(),
            cache_key: OnceLock::new(),
            dedup_entry: Mutex::new(None),
            attempts: AtomicU32::new(0),
        }
    }

    /// Identifier correlating log events across stages and restarts.
    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    /// The original params, as passed to the top-level query. Restarts
    /// re-enter the pipeline with these, not with any transformed params.
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// The per-call configuration.
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// How many restarts have been recorded for this logical query.
    pub fn attempt(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    /// Resolves the concurrency key once; later hooks observe the same key.
    pub(crate) fn concurrent_key(&self, spec: &KeySpec, params: &Value) -> &str {
        self.concurrent_key.get_or_init(|| spec.resolve(params))
    }

    pub(crate) fn concurrent_key_resolved(&self) -> Option<&str> {
        self.concurrent_key.get().map(String::as_str)
    }

    /// Resolves the cache key once; later hooks observe the same key.
    pub(crate) fn cache_key(&self, spec: &KeySpec, params: &Value) -> &str {
        self.cache_key.get_or_init(|| spec.resolve(params))
    }

    pub(crate) fn cache_key_resolved(&self) -> Option<&str> {
        self.cache_key.get().map(String::as_str)
    }

    /// Remembers the dedup entry registered by this call, marking it as the
    /// owner responsible for settling the entry.
    pub(crate) fn set_dedup_entry(&self, entry: Arc<DeferredValue<Value, QueryError>>) {
        *self.dedup_entry.lock() = Some(entry);
    }

    pub(crate) fn dedup_entry(&self) -> Option<Arc<DeferredValue<Value, QueryError>>> {
        self.dedup_entry.lock().clone()
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("query_id", &self.query_id)
            .field("params", &self.params)
            .field("attempts", &self.attempts.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
