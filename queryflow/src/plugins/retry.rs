//! Error-driven retry with backoff strategies.
//!
//! Flags errors (and error-shaped successes) with a configurable predicate
//! and asks the chain to re-run the logical query, bounded by an attempt
//! counter and spaced by a backoff interval.

use crate::chain::{QueryContext, QueryStage};
use crate::errors::QueryError;
use crate::plugins::{ErrorDisposition, QueryPlugin};
use crate::utils::is_truthy;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default number of retries (not counting the initial attempt).
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default delay between attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(300);

/// Decides whether a payload represents an error condition.
///
/// Applied to successful responses by the after-hook and to error payloads
/// by the error-hook, so one predicate covers both "failed" and
/// "succeeded-with-an-error-body" transports.
pub type ErrorPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// delay = base (constant)
    #[default]
    Constant,
    /// delay = base * attempt
    Linear,
    /// delay = base * 2^(attempt - 1)
    Exponential,
}

impl BackoffStrategy {
    /// Calculates the delay before the given attempt (1-indexed).
    #[must_use]
    pub fn delay(self, base: Duration, attempt: u32) -> Duration {
        match self {
            Self::Constant => base,
            Self::Linear => base * attempt,
            Self::Exponential => base * 2_u32.pow(attempt.saturating_sub(1)),
        }
    }
}

/// Jitter strategy to prevent thundering herds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JitterStrategy {
    /// No jitter.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

impl JitterStrategy {
    /// Applies jitter to a delay.
    #[must_use]
    pub fn apply(self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        match self {
            Self::None => delay,
            Self::Full => {
                let millis = delay.as_millis() as u64;
                Duration::from_millis(rng.gen_range(0..=millis))
            }
            Self::Equal => {
                let millis = delay.as_millis() as u64;
                let half = millis / 2;
                Duration::from_millis(half + rng.gen_range(0..=half))
            }
        }
    }
}

/// Per-call configuration for error retry.
#[derive(Clone)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt.
    pub count: u32,
    /// Base delay between attempts.
    pub interval: Duration,
    /// How the delay grows with the attempt number.
    pub backoff: BackoffStrategy,
    /// Randomness applied to the computed delay.
    pub jitter: JitterStrategy,
    /// Predicate flagging payloads as error conditions.
    pub check_error: ErrorPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_RETRY_COUNT,
            interval: DEFAULT_RETRY_INTERVAL,
            backoff: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
            check_error: Arc::new(is_truthy),
        }
    }
}

impl RetryConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Sets the base delay between attempts.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the error predicate.
    #[must_use]
    pub fn with_check_error(
        mut self,
        check: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.check_error = Arc::new(check);
        self
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("count", &self.count)
            .field("interval", &self.interval)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

/// Plugin re-running the logical query on detected errors.
///
/// Stateless: the attempt counter lives in the query context, so one plugin
/// instance serves any number of chains and calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPlugin;

impl RetryPlugin {
    /// Creates the retry plugin.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QueryPlugin for RetryPlugin {
    async fn on_queryed(
        &self,
        response: Value,
        ctx: &QueryContext,
    ) -> Result<Option<Value>, QueryError> {
        let Some(config) = ctx.options().error_retry.as_ref() else {
            return Ok(None);
        };
        if (config.check_error)(&response) {
            debug!(query_id = %ctx.query_id(), "response flagged as error condition");
            return Err(QueryError::Response(response));
        }
        Ok(None)
    }

    async fn on_error(
        &self,
        error: &QueryError,
        ctx: &QueryContext,
        stage: QueryStage,
    ) -> ErrorDisposition {
        let Some(config) = ctx.options().error_retry.as_ref() else {
            return ErrorDisposition::Continue;
        };

        let payload = error.payload();
        if !(config.check_error)(payload) {
            // Not an error by this caller's definition; deliver the payload
            // as the result.
            return ErrorDisposition::Recover(payload.clone());
        }

        let attempt = ctx.attempt();
        if attempt >= config.count {
            debug!(query_id = %ctx.query_id(), attempt, "retries exhausted");
            return ErrorDisposition::Continue;
        }

        let delay = config.jitter.apply(config.backoff.delay(config.interval, attempt + 1));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        ctx.record_attempt();
        debug!(
            query_id = %ctx.query_id(),
            attempt = attempt + 1,
            stage = stage.name(),
            "retrying query"
        );
        ErrorDisposition::Restart
    }
}
