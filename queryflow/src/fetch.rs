//! The injected fetch collaborator.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

/// Outcome of one fetch attempt: a response payload or an error payload.
///
/// Both sides are raw values; the chain wraps a rejection into
/// [`crate::errors::QueryError::Dispatch`] without inspecting it.
pub type FetchResult = Result<Value, Value>;

/// The asynchronous operation wrapped by a query chain.
///
/// The chain never inspects a fetcher's internals; it only awaits the
/// outcome. Any `async` closure from params to [`FetchResult`] implements
/// this trait, so most callers never name it:
///
/// ```rust,ignore
/// let chain = QueryChain::new(|params| async move { Ok(params) });
/// ```
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Performs the underlying request with the (possibly transformed) params.
    async fn fetch(&self, params: Value) -> FetchResult;
}

#[async_trait]
impl<F, Fut> Fetcher for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = FetchResult> + Send + 'static,
{
    async fn fetch(&self, params: Value) -> FetchResult {
        (self)(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closures_are_fetchers() {
        let fetcher = |params: Value| async move { Ok::<_, Value>(json!({"echo": params})) };
        let out = fetcher.fetch(json!(1)).await;
        assert_eq!(out, Ok(json!({"echo": 1})));
    }

    #[tokio::test]
    async fn fetchers_can_reject() {
        let fetcher = |_params: Value| async move { Err::<Value, _>(json!("unreachable host")) };
        assert_eq!(fetcher.fetch(json!(1)).await, Err(json!("unreachable host")));
    }
}
