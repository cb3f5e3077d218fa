//! Error taxonomy and retry policy (§7).
//!
//! `GatewayError` is the one error type that crosses every component boundary in the
//! dispatch pipeline. It carries exactly what the SSE `error` event and the
//! non-streaming JSON error envelope need, and maps to an HTTP status at the edge.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// The taxonomy from §7. Each variant states whether the handler may retry it and,
/// where applicable, the suggested backoff.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Bad request; never retried; returned synchronously.
    #[error("validation: {0}")]
    Validation(String),
    /// Missing or invalid org; never retried.
    #[error("auth: {0}")]
    Auth(String),
    /// Upstream 429 or pacer timeout; retried up to 2 times with exponential backoff.
    #[error("rate limited: {0}")]
    RateLimited {
        /// Human-readable detail.
        message: String,
        /// Suggested client retry delay, when the upstream provided one.
        retry_after_ms: Option<u64>,
    },
    /// 5xx, network reset, or timeout on first byte; retried up to 2 times.
    #[error("upstream transient: {0}")]
    UpstreamTransient(String),
    /// 4xx (not rate-limit) or malformed response; not retried.
    #[error("upstream fatal: {0}")]
    UpstreamFatal(String),
    /// Client disconnect. No error is surfaced to the client; counted separately.
    #[error("cancelled")]
    Cancelled,
    /// First-token or overall deadline exceeded; not retried by the handler.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl GatewayError {
    /// Machine-readable kind string used in the SSE `error` event and JSON envelope.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Auth(_) => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamTransient(_) => "upstream_transient",
            Self::UpstreamFatal(_) => "upstream_fatal",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Whether this error class is retryable by the leader body.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::UpstreamTransient(_))
    }

    /// Suggested retry delay in milliseconds, when known.
    #[must_use]
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// HTTP status for the non-streaming endpoint.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamFatal(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTransient(_) => StatusCode::BAD_GATEWAY,
            Self::Cancelled => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Build the body of an SSE/JSON `error` event.
    #[must_use]
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.retryable(),
            retry_after_ms: self.retry_after_ms(),
        }
    }
}

/// The JSON shape of an `error` event (§6.2) or non-streaming error response.
#[derive(Serialize, Clone, Debug)]
pub struct ErrorBody {
    /// Taxonomy kind, e.g. `"upstream_transient"`.
    pub kind: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Whether the handler already retried this within its bounded policy.
    pub retryable: bool,
    /// Suggested client-side retry delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_error_body();
        (status, Json(body)).into_response()
    }
}

/// Bounded exponential backoff schedule for `rate_limited` / `upstream_transient`
/// retries: starts at 250ms, doubles per attempt, at most 2 retries (§7).
#[must_use]
pub fn backoff_delay_ms(attempt: u32) -> u64 {
    const BASE_MS: u64 = 250;
    BASE_MS.saturating_mul(1u64 << attempt.min(8))
}

/// Maximum retries for transient/rate-limited errors (§7).
pub const MAX_RETRIES: u32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_retryable_match_taxonomy() {
        assert!(GatewayError::RateLimited { message: "x".into(), retry_after_ms: None }.retryable());
        assert!(GatewayError::UpstreamTransient("x".into()).retryable());
        assert!(!GatewayError::UpstreamFatal("x".into()).retryable());
        assert!(!GatewayError::Validation("x".into()).retryable());
        assert_eq!(GatewayError::Timeout("x".into()).kind(), "timeout");
    }

    #[test]
    fn backoff_doubles_from_250ms() {
        assert_eq!(backoff_delay_ms(0), 250);
        assert_eq!(backoff_delay_ms(1), 500);
        assert_eq!(backoff_delay_ms(2), 1000);
    }

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(GatewayError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(GatewayError::Auth("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::Timeout("x".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
