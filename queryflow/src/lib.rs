//! # Queryflow
//!
//! A pluggable asynchronous request pipeline.
//!
//! Queryflow wraps an arbitrary asynchronous fetch operation with a chain of
//! plugins that can transform parameters before dispatch, transform or reject
//! the response after dispatch, and intercept or retry on error:
//!
//! - **Query chain**: a three-stage protocol (before, dispatch, after) run
//!   across all registered plugins, with a shared error-interception
//!   sub-protocol reachable from every stage
//! - **Concurrency limiting**: cap simultaneous in-flight requests per key,
//!   queueing the excess FIFO
//! - **Request deduplication and caching**: collapse concurrent identical
//!   requests into one real fetch and serve a persisted cache afterwards
//! - **Error retry**: re-run failed queries, bounded by count and backoff
//! - **Deferred values**: manually-settled futures bridging external
//!   completion signals (slot release, cache fill) into awaitable results
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use queryflow::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let chain = QueryChain::new(|params| async move { Ok(json!({"echo": params})) })
//!     .with_plugin(Arc::new(ConcurrencyLimiter::new()))
//!     .with_plugin(Arc::new(DedupCache::new()))
//!     .with_plugin(Arc::new(RetryPlugin::new()));
//!
//! let options = QueryOptions::new()
//!     .with_cache(CacheConfig::default())
//!     .with_error_retry(RetryConfig::default());
//!
//! let response = chain.query(json!({"id": 1}), options).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod chain;
pub mod deferred;
pub mod errors;
pub mod fetch;
pub mod plugins;
pub mod storage;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::chain::{QueryChain, QueryContext, QueryOptions, QueryStage};
    pub use crate::deferred::{DeferredStatus, DeferredValue};
    pub use crate::errors::QueryError;
    pub use crate::fetch::{FetchResult, Fetcher};
    pub use crate::plugins::{
        BackoffStrategy, CacheConfig, ConcurrencyLimiter, ConcurrentConfig, DedupCache,
        ErrorDisposition, ErrorPredicate, JitterStrategy, KeySpec, QueryPlugin, RetryConfig,
        RetryPlugin,
    };
    pub use crate::storage::{CacheStore, MemoryStore};
    pub use crate::utils::content_key;
}
