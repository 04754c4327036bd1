//! Request concurrency limiting.
//!
//! Caps the number of simultaneously in-flight requests per key. Excess
//! requests park on a deferred value in a FIFO queue; completing requests
//! (successfully or not) release exactly one slot each, either handing it
//! straight to the queue head or decrementing the in-flight count.

use crate::chain::{QueryContext, QueryStage};
use crate::deferred::DeferredValue;
use crate::errors::QueryError;
use crate::plugins::{ErrorDisposition, KeySpec, QueryPlugin};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Default maximum in-flight requests per key.
pub const DEFAULT_CONCURRENT_COUNT: usize = 3;

/// Per-call configuration for the concurrency limiter.
#[derive(Debug, Clone)]
pub struct ConcurrentConfig {
    /// How the slot key is obtained.
    pub key: KeySpec,
    /// Maximum in-flight requests sharing that key.
    pub count: usize,
}

impl Default for ConcurrentConfig {
    fn default() -> Self {
        Self {
            key: KeySpec::ContentHash,
            count: DEFAULT_CONCURRENT_COUNT,
        }
    }
}

impl ConcurrentConfig {
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

    /// Sets the in-flight limit.
    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }
}

type SlotWaiter = Arc<DeferredValue<Value, QueryError>>;

#[derive(Default)]
struct SlotState {
    in_flight: HashMap<String, usize>,
    waiting: HashMap<String, VecDeque<SlotWaiter>>,
}

/// Plugin capping simultaneous in-flight requests per key.
///
/// State is shared by every call going through the same limiter instance;
/// register one `Arc` on each chain that should share slot accounting.
#[derive(Default)]
pub struct ConcurrencyLimiter {
    state: Mutex<SlotState>,
}

impl ConcurrencyLimiter {
    /// Creates a limiter with no slots taken.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current in-flight count for a key.
    pub fn in_flight(&self, key: &str) -> usize {
        self.state.lock().in_flight.get(key).copied().unwrap_or(0)
    }

    /// Number of requests queued for a key.
    pub fn queued(&self, key: &str) -> usize {
        self.state
            .lock()
            .waiting
            .get(key)
            .map_or(0, VecDeque::len)
    }

    /// Releases one slot for `key`: hands it to the queue head (count
    /// unchanged) or decrements the in-flight count.
    fn release(&self, key: &str) {
        let handoff = {
            let mut state = self.state.lock();
            let next = state.waiting.get_mut(key).and_then(VecDeque::pop_front);
            if next.is_some() {
                if state.waiting.get(key).is_some_and(VecDeque::is_empty) {
                    state.waiting.remove(key);
                }
            } else {
                match state.in_flight.get_mut(key) {
                    Some(count) if *count > 1 => *count -= 1,
                    Some(_) => {
                        state.in_flight.remove(key);
                    }
                    None => {}
                }
            }
            next
        };
        if let Some(waiter) = handoff {
            waiter.success(None);
        }
    }
}

#[async_trait]
impl QueryPlugin for ConcurrencyLimiter {
    async fn on_query_before(
        &self,
        params: Value,
        ctx: &QueryContext,
    ) -> Result<Option<Value>, QueryError> {
        let Some(config) = ctx.options().concurrent.as_ref() else {
            return Ok(None);
        };
        let key = ctx.concurrent_key(&config.key, &params).to_owned();

        let waiter = {
            let mut state = self.state.lock();
            let current = state.in_flight.get(&key).copied().unwrap_or(0);
            if current < config.count {
                state.in_flight.insert(key.clone(), current + 1);
                None
            } else {
                let deferred: SlotWaiter =
                    Arc::new(DeferredValue::new().with_default(params.clone()));
                state
                    .waiting
                    .entry(key.clone())
                    .or_default()
                    .push_back(Arc::clone(&deferred));
                Some(deferred)
            }
        };

        let Some(waiter) = waiter else {
            debug!(query_id = %ctx.query_id(), key = %key, "slot acquired");
            return Ok(None);
        };

        debug!(query_id = %ctx.query_id(), key = %key, "at capacity, queued");
        match waiter.result().await {
            Ok(seeded) => Ok(seeded),
            Err(Some(error)) => Err(error),
            Err(None) => Ok(None),
        }
    }

    async fn on_queryed(
        &self,
        _response: Value,
        ctx: &QueryContext,
    ) -> Result<Option<Value>, QueryError> {
        if ctx.options().concurrent.is_some() {
            if let Some(key) = ctx.concurrent_key_resolved() {
                self.release(key);
                debug!(query_id = %ctx.query_id(), key = %key, "slot released");
            }
        }
        Ok(None)
    }

    async fn on_error(
        &self,
        _error: &QueryError,
        ctx: &QueryContext,
        _stage: QueryStage,
    ) -> ErrorDisposition {
        if ctx.options().concurrent.is_some() {
            if let Some(key) = ctx.concurrent_key_resolved() {
                self.release(key);
                debug!(query_id = %ctx.query_id(), key = %key, "slot released on error");
            }
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
    use std::time::Duration;

    fn options(key: &str, count: usize) -> QueryOptions {
        QueryOptions::new().with_concurrent(ConcurrentConfig::new().with_key(key).with_count(count))
    }

    #[tokio::test]
    async fn passthrough_when_not_requested() {
        let limiter = Arc::new(ConcurrencyLimiter::new());
        let chain = QueryChain::new(|params: Value| async move { Ok::<_, Value>(params) })
            .with_plugin(Arc::clone(&limiter) as Arc<dyn QueryPlugin>);

        let out = chain.query(json!({"id": 1}), QueryOptions::new()).await;
        assert_eq!(out, Ok(json!({"id": 1})));
        assert_eq!(limiter.in_flight("anything"), 0);
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let fetcher = {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            move |params: Value| {
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Value>(params)
                }
            }
        };

        let chain = Arc::new(
            QueryChain::new(fetcher).with_plugin(Arc::new(ConcurrencyLimiter::new())),
        );

        let mut handles = Vec::new();
        for _ in 0..10 {
            let chain = Arc::clone(&chain);
            handles.push(tokio::spawn(async move {
                chain.query(json!({"id": 1}), options("shared", 3)).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn queued_requests_release_in_arrival_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let fetcher = {
            let order = Arc::clone(&order);
            move |params: Value| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().push(params["seq"].as_u64().unwrap_or(u64::MAX));
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    Ok::<_, Value>(params)
                }
            }
        };

        let chain = Arc::new(
            QueryChain::new(fetcher).with_plugin(Arc::new(ConcurrencyLimiter::new())),
        );

        let mut handles = Vec::new();
        for seq in 0..5_u64 {
            let chain = Arc::clone(&chain);
            handles.push(tokio::spawn(async move {
                chain.query(json!({"seq": seq}), options("fifo", 1)).await
            }));
            // Space out arrivals so the queue order is deterministic.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn errors_release_their_slot() {
        let limiter = Arc::new(ConcurrencyLimiter::new());
        let chain = QueryChain::new(|params: Value| async move {
            if params["fail"] == json!(true) {
                Err(json!("boom"))
            } else {
                Ok(params)
            }
        })
        .with_plugin(Arc::clone(&limiter) as Arc<dyn QueryPlugin>);

        let failed = chain.query(json!({"fail": true}), options("err", 1)).await;
        assert!(failed.is_err());
        assert_eq!(limiter.in_flight("err"), 0);

        // The freed slot admits the next request immediately.
        let ok = chain.query(json!({"fail": false}), options("err", 1)).await;
        assert_eq!(ok, Ok(json!({"fail": false})));
        assert_eq!(limiter.in_flight("err"), 0);
    }

    #[tokio::test]
    async fn distinct_params_limit_independently_under_content_hash() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let fetcher = {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            move |params: Value| {
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Value>(params)
                }
            }
        };

        let chain = Arc::new(
            QueryChain::new(fetcher).with_plugin(Arc::new(ConcurrencyLimiter::new())),
        );

        let mut handles = Vec::new();
        for id in 0..2 {
            let chain = Arc::clone(&chain);
            handles.push(tokio::spawn(async move {
                let options = QueryOptions::new()
                    .with_concurrent(ConcurrentConfig::new().with_count(1));
                chain.query(json!({"id": id}), options).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        // Different content keys never contend for the same slot.
        assert_eq!(max_seen.load(Ordering::SeqCst), 2);
    }
}
