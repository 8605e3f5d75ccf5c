//! HTTP mapping of guard errors.
//!
//! # Design Decisions
//! - Stable machine codes in a JSON body: `{"error": {"code", "message"}}`
//! - Rate-limit denials carry `Retry-After` in whole seconds, rounded up
//! - Resilience-layer faults are logged at error level; dependency faults are not

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::guard::types::GuardError;

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: String,
}

impl IntoResponse for GuardError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if self.is_internal() {
            tracing::error!(code = self.code(), error = %self, "Resilience layer fault");
        }

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
            },
        };
        let mut response = (status, Json(body)).into_response();

        if let Some(retry_after) = self.retry_after() {
            let secs = retry_after
                .as_secs()
                .saturating_add(u64::from(retry_after.subsec_nanos() > 0));
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::classify::CallError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_rate_limit_response() {
        let response = GuardError::RateLimitExceeded {
            key: "ip:1".into(),
            retry_after: Duration::from_millis(1200),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "rate_limit_exceeded");
    }

    #[test]
    fn test_unbounded_retry_after_saturates() {
        let response = GuardError::RateLimitExceeded {
            key: "ip:1".into(),
            retry_after: Duration::MAX,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], u64::MAX.to_string().as_str());
    }

    #[tokio::test]
    async fn test_exhausted_timeouts_map_to_gateway_timeout() {
        let response = GuardError::RetryExhausted {
            last_error: CallError::Timeout,
            attempts: 3,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
}
