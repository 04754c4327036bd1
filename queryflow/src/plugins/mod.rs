//! Plugins for the query chain.
//!
//! A plugin is a set of optional hooks invoked by the chain at each stage:
//! before dispatch (params transformation), after dispatch (response
//! transformation), and on error (interception and recovery). The three
//! built-in plugins cover concurrency limiting, request dedup/caching, and
//! error retry; anything implementing [`QueryPlugin`] composes with them.

mod concurrency;
mod dedup;
mod retry;

pub use concurrency::{ConcurrencyLimiter, ConcurrentConfig, DEFAULT_CONCURRENT_COUNT};
pub use dedup::{CacheConfig, DedupCache, DEFAULT_CACHE_TIME, DEFAULT_STALE_TIME};
pub use retry::{
    BackoffStrategy, ErrorPredicate, JitterStrategy, RetryConfig, RetryPlugin,
    DEFAULT_RETRY_COUNT, DEFAULT_RETRY_INTERVAL,
};

use crate::chain::{QueryContext, QueryStage};
use crate::errors::QueryError;
use crate::utils::content_key;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// How a key identifying shared limiter/cache state is obtained.
#[derive(Clone, Default)]
pub enum KeySpec {
    /// Hash the serialized params (the default): logically identical
    /// requests share a key without any caller configuration.
    #[default]
    ContentHash,
    /// A fixed key supplied by the caller.
    Literal(String),
    /// A caller-supplied function deriving the key from the params.
    Derive(Arc<dyn Fn(&Value) -> String + Send + Sync>),
}

impl KeySpec {
    /// Resolves the key for the given params.
    #[must_use]
    pub fn resolve(&self, params: &Value) -> String {
        match self {
            Self::ContentHash => content_key(params),
            Self::Literal(key) => key.clone(),
            Self::Derive(derive) => derive(params),
        }
    }

    /// Wraps a key-deriving function.
    #[must_use]
    pub fn derive(f: impl Fn(&Value) -> String + Send + Sync + 'static) -> Self {
        Self::Derive(Arc::new(f))
    }
}

impl fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContentHash => write!(f, "ContentHash"),
            Self::Literal(key) => f.debug_tuple("Literal").field(key).finish(),
            Self::Derive(_) => write!(f, "Derive(..)"),
        }
    }
}

impl From<&str> for KeySpec {
    fn from(key: &str) -> Self {
        Self::Literal(key.to_string())
    }
}

impl From<String> for KeySpec {
    fn from(key: String) -> Self {
        Self::Literal(key)
    }
}

/// A plugin error-hook's verdict on the error it was shown.
#[derive(Debug)]
pub enum ErrorDisposition {
    /// No opinion; the next plugin sees the same error.
    Continue,
    /// Swap in a different error; the next plugin sees the replacement.
    Replace(QueryError),
    /// Resolve the whole query successfully with this value. Later plugins
    /// are not consulted.
    Recover(Value),
    /// Re-run the logical query from the before stage with the original
    /// params and the same context. The requesting plugin is responsible for
    /// bounding how often it asks.
    Restart,
}

/// Hooks invoked by the query chain at each stage.
///
/// All hooks are optional; the defaults pass params, responses, and errors
/// through untouched. Hooks run in plugin registration order.
#[async_trait]
pub trait QueryPlugin: Send + Sync {
    /// Runs before dispatch. Return `Ok(Some(params))` to replace the params
    /// seen by later plugins and the fetch, `Ok(None)` to leave them as-is,
    /// or an error to divert into the error-interception sub-protocol.
    ///
    /// A hook may suspend here (awaiting a slot, a shared in-flight result)
    /// and the whole query suspends with it.
    async fn on_query_before(
        &self,
        _params: Value,
        _ctx: &QueryContext,
    ) -> Result<Option<Value>, QueryError> {
        Ok(None)
    }

    /// Runs after a response is available. Return `Ok(Some(response))` to
    /// replace it, `Ok(None)` to leave it as-is, or an error to divert into
    /// the error-interception sub-protocol.
    async fn on_queryed(
        &self,
        _response: Value,
        _ctx: &QueryContext,
    ) -> Result<Option<Value>, QueryError> {
        Ok(None)
    }

    /// Inspects an error raised at `stage` and answers with a disposition.
    async fn on_error(
        &self,
        _error: &QueryError,
        _ctx: &QueryContext,
        _stage: QueryStage,
    ) -> ErrorDisposition {
        ErrorDisposition::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn literal_keys_resolve_verbatim() {
        let spec = KeySpec::from("user-list");
        assert_eq!(spec.resolve(&json!({"page": 3})), "user-list");
    }

    #[test]
    fn derived_keys_see_the_params() {
        let spec = KeySpec::derive(|params| format!("user-{}", params["id"]));
        assert_eq!(spec.resolve(&json!({"id": 9})), "user-9");
    }

    #[test]
    fn default_is_content_hash() {
        let spec = KeySpec::default();
        let a = spec.resolve(&json!({"id": 1}));
        let b = spec.resolve(&json!({"id": 1}));
        let c = spec.resolve(&json!({"id": 2}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
