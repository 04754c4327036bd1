//! Error types for the queryflow pipeline.
//!
//! Every stage of the query chain funnels failures through the same
//! error-interception sub-protocol, so the taxonomy is small: one variant per
//! originating stage, plus the internal duplicate signal used by the
//! dedup/cache plugin to fan a shared result back through the error channel.

use serde_json::Value;
use thiserror::Error;

/// The error type threaded through the query chain.
///
/// Each variant carries the raw payload produced by the failing party (a
/// plugin hook or the injected fetch). The chain itself never inspects
/// payloads; interpretation is left to plugin error-hooks.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    /// A before-hook rejected the parameters.
    #[error("before hook rejected: {0}")]
    Param(Value),

    /// The injected fetch rejected.
    #[error("fetch rejected: {0}")]
    Dispatch(Value),

    /// An after-hook rejected the response, or a retry predicate flagged a
    /// successful response as an error condition.
    #[error("response flagged as error: {0}")]
    Response(Value),

    /// Internal marker routing a cached or shared payload through the error
    /// channel back into a resolved result. Never surfaced to callers while a
    /// dedup/cache plugin is registered.
    #[error("duplicate result signal: {0}")]
    Duplicate(Value),
}

impl QueryError {
    /// Returns the payload carried by this error, whatever its origin.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        match self {
            Self::Param(v) | Self::Dispatch(v) | Self::Response(v) | Self::Duplicate(v) => v,
        }
    }

    /// Consumes the error and returns its payload.
    #[must_use]
    pub fn into_payload(self) -> Value {
        match self {
            Self::Param(v) | Self::Dispatch(v) | Self::Response(v) | Self::Duplicate(v) => v,
        }
    }

    /// Returns true for the internal duplicate signal.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_is_uniform_across_variants() {
        let payload = json!({"code": 500});
        for err in [
            QueryError::Param(payload.clone()),
            QueryError::Dispatch(payload.clone()),
            QueryError::Response(payload.clone()),
            QueryError::Duplicate(payload.clone()),
        ] {
            assert_eq!(err.payload(), &payload);
            assert_eq!(err.into_payload(), payload);
        }
    }

    #[test]
    fn only_duplicate_is_duplicate() {
        assert!(QueryError::Duplicate(json!(1)).is_duplicate());
        assert!(!QueryError::Dispatch(json!(1)).is_duplicate());
    }

    #[test]
    fn display_includes_payload() {
        let err = QueryError::Dispatch(json!({"reason": "timeout"}));
        assert!(err.to_string().contains("timeout"));
    }
}
