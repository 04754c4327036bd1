//! The query chain: stages, error interception, and the top-level entry.
//!
//! A chain wraps one injected fetch operation and any number of plugins.
//! Each `query` call runs the three-stage protocol (before-hooks, dispatch,
//! after-hooks) in plugin registration order, with a shared
//! error-interception sub-protocol reachable from every stage.

mod context;

pub use context::{QueryContext, QueryOptions};

use crate::errors::QueryError;
use crate::fetch::Fetcher;
use crate::plugins::{ErrorDisposition, QueryPlugin};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// The pipeline stage at which an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    /// Params transformation, before dispatch.
    Before,
    /// The injected fetch itself.
    Dispatch,
    /// Response transformation, after dispatch.
    After,
}

impl QueryStage {
    /// Short stage name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::Dispatch => "dispatch",
            Self::After => "after",
        }
    }
}

/// Outcome of the error-interception sub-protocol.
enum ErrorOutcome {
    /// A plugin resolved the error into a value.
    Recovered(Value),
    /// A plugin asked for the logical query to run again.
    Restart,
    /// No plugin intercepted; this is the terminal error.
    Rejected(QueryError),
}

/// Outcome of one pass through the three stages.
enum RunOutcome {
    Done(Value),
    Restart,
    Failed(QueryError),
}

/// A pluggable asynchronous request pipeline around one fetch operation.
///
/// Plugins registered with [`Self::with_plugin`] share their internal state
/// across every call on this chain (and on any other chain holding the same
/// `Arc`), which is what lets the limiter and dedup plugins coordinate
/// overlapping calls.
pub struct QueryChain {
    fetcher: Arc<dyn Fetcher>,
    plugins: Vec<Arc<dyn QueryPlugin>>,
}

impl QueryChain {
    /// Creates a chain around the injected fetch operation.
    #[must_use]
    pub fn new(fetcher: impl Fetcher + 'static) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            plugins: Vec::new(),
        }
    }

    /// Registers a plugin. Hooks run in registration order.
    #[must_use]
    pub fn with_plugin(mut self, plugin: Arc<dyn QueryPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Runs one logical query through the pipeline.
    ///
    /// Resolves with the final after-stage response, or rejects with
    /// whatever error the interception sub-protocol last held. A restart
    /// verdict from a plugin re-enters the pipeline with the original
    /// params; the requesting plugin's own bookkeeping bounds how often
    /// that can happen.
    pub async fn query(&self, params: Value, options: QueryOptions) -> Result<Value, QueryError> {
        let ctx = QueryContext::new(params, options);
        debug!(query_id = %ctx.query_id(), "query started");
        loop {
            match self.run_once(&ctx).await {
                RunOutcome::Done(response) => {
                    debug!(query_id = %ctx.query_id(), "query resolved");
                    return Ok(response);
                }
                RunOutcome::Failed(error) => {
                    warn!(query_id = %ctx.query_id(), %error, "query rejected");
                    return Err(error);
                }
                RunOutcome::Restart => {
                    debug!(
                        query_id = %ctx.query_id(),
                        attempt = ctx.attempt(),
                        "query restarted"
                    );
                }
            }
        }
    }

    /// One pass over the three stages.
    async fn run_once(&self, ctx: &QueryContext) -> RunOutcome {
        let mut params = ctx.params().clone();
        let mut early_response: Option<Value> = None;

        // BEFORE: thread params through each plugin in order. A failure
        // diverts into error interception and ends the stage; a recovery
        // there stands in for the dispatch response.
        for plugin in &self.plugins {
            match plugin.on_query_before(params.clone(), ctx).await {
                Ok(Some(next)) => params = next,
                Ok(None) => {}
                Err(error) => {
                    match self.run_error(error, ctx, QueryStage::Before).await {
                        ErrorOutcome::Recovered(value) => early_response = Some(value),
                        ErrorOutcome::Restart => return RunOutcome::Restart,
                        ErrorOutcome::Rejected(error) => return RunOutcome::Failed(error),
                    }
                    break;
                }
            }
        }

        // DISPATCH: skipped when a response was already supplied.
        let mut response = if let Some(value) = early_response {
            debug!(query_id = %ctx.query_id(), "dispatch skipped, response already supplied");
            value
        } else {
            match self.fetcher.fetch(params).await {
                Ok(value) => value,
                Err(payload) => {
                    let error = QueryError::Dispatch(payload);
                    match self.run_error(error, ctx, QueryStage::Dispatch).await {
                        ErrorOutcome::Recovered(value) => value,
                        ErrorOutcome::Restart => return RunOutcome::Restart,
                        ErrorOutcome::Rejected(error) => return RunOutcome::Failed(error),
                    }
                }
            }
        };

        // AFTER: thread the response through each plugin in order. A failure
        // ends the stage; a recovery there is the final result.
        for plugin in &self.plugins {
            match plugin.on_queryed(response.clone(), ctx).await {
                Ok(Some(next)) => response = next,
                Ok(None) => {}
                Err(error) => {
                    return match self.run_error(error, ctx, QueryStage::After).await {
                        ErrorOutcome::Recovered(value) => RunOutcome::Done(value),
                        ErrorOutcome::Restart => RunOutcome::Restart,
                        ErrorOutcome::Rejected(error) => RunOutcome::Failed(error),
                    };
                }
            }
        }

        RunOutcome::Done(response)
    }

    /// The error-interception sub-protocol shared by all stages.
    ///
    /// Walks plugins in registration order. Each error-hook may pass, swap
    /// the working error, recover with a value, or request a restart; the
    /// first recovery or restart ends the walk. No interception means the
    /// last working error is terminal.
    async fn run_error(
        &self,
        mut error: QueryError,
        ctx: &QueryContext,
        stage: QueryStage,
    ) -> ErrorOutcome {
        debug!(
            query_id = %ctx.query_id(),
            stage = stage.name(),
            "error interception"
        );
        for plugin in &self.plugins {
            match plugin.on_error(&error, ctx, stage).await {
                ErrorDisposition::Continue => {}
                ErrorDisposition::Replace(next) => error = next,
                ErrorDisposition::Recover(value) => return ErrorOutcome::Recovered(value),
                ErrorDisposition::Restart => return ErrorOutcome::Restart,
            }
        }
        ErrorOutcome::Rejected(error)
    }
}

impl fmt::Debug for QueryChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryChain")
            .field("plugins", &self.plugins.len())
            .finish_non_exhaustive()
    }
}
