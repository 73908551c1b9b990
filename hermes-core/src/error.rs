//! # Error Taxonomy
//!
//! Errors in the engine fall into the classes the dispatcher acts on:
//!
//! - **`UpstreamError`** — wire-level faults talking to a provider
//!   (transport, timeout, 5xx). These are retryable on other candidates and
//!   feed the circuit breaker.
//! - **`StoreError`** — persistence failures. These are logged and never
//!   fatal to request handling.
//! - **`DispatchError`** — terminal outcomes of a dispatch: no candidates,
//!   all candidates exhausted, or a client error to surface unchanged.
//!
//! The proxy itself never returns a bare error to the dispatcher; it returns
//! a classified [`AttemptClass`] so retry policy stays in one place.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level failure talking to an upstream provider.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// HTTP client and network communication errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream returned a non-success status outside the classified cases
    #[error("API error: {code} - {message}")]
    Api { code: u16, message: String },

    /// Request or stream-idle timeout
    #[error("Timeout")]
    Timeout,

    /// Response body exceeded the configured buffering cap
    #[error("Response body over {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// JSON serialization and deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence failure in the store or log sink.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Store worker unavailable")]
    WorkerGone,
}

/// Classification of one proxy attempt, the unit the retry policy acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptClass {
    /// 2xx and the body (or stream) completed cleanly.
    Success,
    /// 404 matching the model-missing markers: local filter + re-sync,
    /// retried without tripping the breaker.
    ModelMissing,
    /// 429 or a 4xx matching the quota markers: breaker trip, retryable.
    QuotaExhausted,
    /// Transport error, timeout, or 5xx: breaker trip, retryable.
    ProviderFault,
    /// Any other 4xx: surfaced to the caller untouched, no retry.
    ClientError,
}

impl AttemptClass {
    /// Whether the dispatcher may try the next candidate after this outcome.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            AttemptClass::ModelMissing | AttemptClass::QuotaExhausted | AttemptClass::ProviderFault
        )
    }

    /// Whether this outcome counts as a qualifying failure for the breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            AttemptClass::QuotaExhausted | AttemptClass::ProviderFault
        )
    }
}

/// One attempted provider in a failed dispatch, reported in the terminal
/// 502 envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptReport {
    pub provider_id: String,
    pub class: AttemptClass,
    pub detail: String,
}

/// Terminal outcome of a dispatch that produced no upstream response to
/// forward.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No active provider advertises the requested model.
    #[error("No provider serves model: {model}")]
    NoCandidates { model: String },

    /// Every candidate was attempted and failed.
    #[error("All {0} candidate providers failed", .attempts.len())]
    Exhausted { attempts: Vec<AttemptReport> },

    /// Upstream returned a client error to pass through unchanged.
    #[error("Upstream rejected the request with status {status}")]
    UpstreamClientError {
        provider_id: String,
        status: u16,
        body: bytes::Bytes,
        content_type: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_matches_classification() {
        assert!(AttemptClass::ModelMissing.retryable());
        assert!(AttemptClass::QuotaExhausted.retryable());
        assert!(AttemptClass::ProviderFault.retryable());
        assert!(!AttemptClass::Success.retryable());
        assert!(!AttemptClass::ClientError.retryable());
    }

    #[test]
    fn breaker_trips_exclude_model_missing_and_client_errors() {
        assert!(AttemptClass::QuotaExhausted.trips_breaker());
        assert!(AttemptClass::ProviderFault.trips_breaker());
        assert!(!AttemptClass::ModelMissing.trips_breaker());
        assert!(!AttemptClass::ClientError.trips_breaker());
        assert!(!AttemptClass::Success.trips_breaker());
    }
}
