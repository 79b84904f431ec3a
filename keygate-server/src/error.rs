//! API error handling module
//!
//! Provides a unified error type for all API endpoints with structured error variants.
//! Quota failures carry the closed integer error codes and scheme-specific
//! `Retry-After` values consumed by clients.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::storage::StorageError;

/// Error code returned when the upstream reports an exhausted budget.
pub const ERROR_CODE_BUDGET_LIMIT_EXCEEDED: u8 = 1;
/// Error code returned when the upstream reports a rate limit.
pub const ERROR_CODE_RATE_LIMIT_EXCEEDED: u8 = 2;

/// Retry-After for budget exhaustion (one day).
pub const RETRY_AFTER_BUDGET: &str = "86400";
/// Retry-After for rate limiting (one minute).
pub const RETRY_AFTER_RATE: &str = "60";

/// API error type with structured variants for different error categories
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad request - client provided invalid input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unauthorized - missing or invalid authentication
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authentication error with specific error code
    #[error("{message}")]
    AuthError { message: String, code: String },

    /// Forbidden - verification of a presented proof failed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Upstream budget exhausted for this principal
    #[error("budget limit exceeded")]
    BudgetExceeded,

    /// Upstream rate limit hit for this principal
    #[error("rate limit exceeded")]
    RateLimited,

    /// Upstream returned an error; status is passed through
    #[error("upstream error ({status}): {message}")]
    Upstream { status: StatusCode, message: String },

    /// Upstream unreachable (connect failure, timeout)
    #[error("proxy failure: {0}")]
    ProxyFailure(String),

    /// Internal server error - unexpected server-side failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Service unavailable - required service is not configured or available
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ApiError {
    /// Create a bad request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Create an authentication error with a specific error code
    pub fn auth_error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthError {
            message: message.into(),
            code: code.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// Create an internal server error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a service unavailable error
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::AuthError { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BudgetExceeded | Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { status, .. } => *status,
            Self::ProxyFailure(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code for programmatic error handling
    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "INVALID_INPUT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::AuthError { .. } => "AUTH_ERROR",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::BudgetExceeded => "BUDGET_LIMIT_EXCEEDED",
            Self::RateLimited => "RATE_LIMIT_EXCEEDED",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::ProxyFailure(_) => "PROXY_FAILURE",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Get the error category for logging
    fn error_category(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::AuthError { .. } => "auth_error",
            Self::Forbidden(_) => "forbidden",
            Self::BudgetExceeded | Self::RateLimited => "throttled",
            Self::Upstream { .. } => "upstream",
            Self::ProxyFailure(_) => "proxy_failure",
            Self::Internal(_) => "internal",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Storage(_) => "storage",
        }
    }

    /// Get sanitized error message for client response
    fn client_message(&self) -> String {
        match self {
            // Storage internals never reach the client
            Self::Storage(_) => "A storage error occurred".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let category = self.error_category();
        let code = self.error_code();
        let internal_message = self.to_string();

        // Log based on severity, always including internal details
        match &self {
            Self::BadRequest(_) => {
                tracing::warn!(
                    status = %status,
                    category = category,
                    code = code,
                    error = %internal_message,
                    "Client error"
                );
            }
            Self::Unauthorized(_) | Self::AuthError { .. } | Self::Forbidden(_) => {
                tracing::warn!(
                    status = %status,
                    category = category,
                    code = code,
                    error = %internal_message,
                    "Authentication error"
                );
            }
            Self::BudgetExceeded | Self::RateLimited => {
                tracing::warn!(
                    status = %status,
                    category = category,
                    code = code,
                    "Request throttled"
                );
            }
            Self::Upstream { .. } | Self::ProxyFailure(_) | Self::ServiceUnavailable(_) => {
                tracing::warn!(
                    status = %status,
                    category = category,
                    code = code,
                    error = %internal_message,
                    "Upstream error"
                );
            }
            Self::Internal(_) | Self::Storage(_) => {
                tracing::error!(
                    status = %status,
                    category = category,
                    code = code,
                    error = %internal_message,
                    "Server error"
                );
            }
        }

        // Quota failures use the closed integer-code contract with Retry-After
        let (retry_after, body) = match &self {
            Self::BudgetExceeded => (
                Some(RETRY_AFTER_BUDGET),
                serde_json::json!({ "error": ERROR_CODE_BUDGET_LIMIT_EXCEEDED }),
            ),
            Self::RateLimited => (
                Some(RETRY_AFTER_RATE),
                serde_json::json!({ "error": ERROR_CODE_RATE_LIMIT_EXCEEDED }),
            ),
            _ => (
                None,
                serde_json::json!({
                    "error": self.client_message(),
                    "code": code,
                }),
            ),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(value) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(value));
        }
        response
    }
}
