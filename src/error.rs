//! Unified gateway error type and its mapping onto the HTTP surface.
//!
//! Pipeline denials, upstream failures, and internal faults all converge
//! here; the handler turns any variant into the JSON error body
//! `{"error": {"type", "message", "request_id"}}`. Internal errors are
//! scrubbed so no underlying detail reaches the client.

use http::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing or invalid API key")]
    Unauthenticated,

    #[error("client is suspended")]
    ClientSuspended,

    #[error("rate limit exceeded")]
    RateLimited { limit: u32, reset_seconds: u64 },

    #[error("model '{model}' not allowed for this client")]
    ModelNotAllowed { model: String },

    #[error("request blocked by security policy (risk score {score:.2})")]
    InjectionBlocked { score: f64 },

    #[error("request contains sensitive data")]
    PiiBlocked,

    #[error("streaming is not supported on this platform")]
    StreamingUnsupported,

    #[error("response blocked by security policy")]
    ResponseBlocked,

    #[error("cannot reach upstream provider: {0}")]
    Upstream(String),

    /// Upstream rejected the request with a status worth passing through
    /// (e.g. provider-side throttling or validation failures).
    #[error("upstream provider rejected the request: {message}")]
    UpstreamRejected { status: StatusCode, message: String },

    #[error("upstream provider timed out")]
    UpstreamTimeout,

    #[error("client store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Stable machine-readable kind, used as `error.type` in response bodies
    /// and as the reason code in audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::ClientSuspended => "client_suspended",
            Self::RateLimited { .. } => "rate_limited",
            Self::ModelNotAllowed { .. } => "model_not_allowed",
            Self::InjectionBlocked { .. } => "injection_blocked",
            Self::PiiBlocked => "pii_blocked",
            Self::StreamingUnsupported => "streaming_unsupported",
            Self::ResponseBlocked => "response_blocked",
            Self::Upstream(_) | Self::UpstreamRejected { .. } => "upstream_error",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status the client observes for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::ClientSuspended => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ModelNotAllowed { .. } => StatusCode::FORBIDDEN,
            Self::InjectionBlocked { .. } => StatusCode::BAD_REQUEST,
            Self::PiiBlocked => StatusCode::BAD_REQUEST,
            Self::StreamingUnsupported => StatusCode::BAD_REQUEST,
            Self::ResponseBlocked => StatusCode::BAD_GATEWAY,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamRejected { status, .. } => *status,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to expose to clients. Internal faults are scrubbed.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

/// JSON error body in the gateway's wire shape.
pub fn error_body(kind: &str, message: &str, request_id: &str) -> Value {
    json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn status_mapping_matches_error_table() {
        let cases: Vec<(GatewayError, StatusCode, &str)> = vec![
            (GatewayError::Unauthenticated, StatusCode::UNAUTHORIZED, "unauthenticated"),
            (GatewayError::ClientSuspended, StatusCode::FORBIDDEN, "client_suspended"),
            (
                GatewayError::RateLimited { limit: 60, reset_seconds: 10 },
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
            ),
            (
                GatewayError::ModelNotAllowed { model: "gpt-4".into() },
                StatusCode::FORBIDDEN,
                "model_not_allowed",
            ),
            (
                GatewayError::InjectionBlocked { score: 1.0 },
                StatusCode::BAD_REQUEST,
                "injection_blocked",
            ),
            (GatewayError::PiiBlocked, StatusCode::BAD_REQUEST, "pii_blocked"),
            (
                GatewayError::StreamingUnsupported,
                StatusCode::BAD_REQUEST,
                "streaming_unsupported",
            ),
            (GatewayError::ResponseBlocked, StatusCode::BAD_GATEWAY, "response_blocked"),
            (
                GatewayError::Upstream("connect refused".into()),
                StatusCode::BAD_GATEWAY,
                "upstream_error",
            ),
            (GatewayError::UpstreamTimeout, StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
            (
                GatewayError::StoreUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
            ),
            (
                GatewayError::Internal(anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ),
        ];
        for (err, status, kind) in cases {
            assert_eq!(err.status(), status, "{kind}");
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn internal_errors_are_scrubbed() {
        let err = GatewayError::Internal(anyhow!("secret connection string leaked"));
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn error_body_shape() {
        let body = error_body("rate_limited", "rate limit exceeded", "abc123def456");
        assert_eq!(body["error"]["type"], "rate_limited");
        assert_eq!(body["error"]["request_id"], "abc123def456");
    }

    #[test]
    fn upstream_rejected_passes_status_through() {
        let err = GatewayError::UpstreamRejected {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "throttled".into(),
        };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.kind(), "upstream_error");
    }
}
