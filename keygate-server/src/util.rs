//! Shared request helpers: bearer extraction and safe base64 decoding.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

use crate::error::ApiError;

/// Decode URL-safe base64, mapping failures to a 400 that names the field
/// without echoing its contents.
pub fn b64decode_safe(encoded: &str, name: &str) -> Result<Vec<u8>, ApiError> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE
        .decode(encoded)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(encoded))
        .map_err(|e| {
            tracing::warn!(field = %name, error = %e, "Invalid base64 in request");
            ApiError::bad_request(format!("Invalid base64 for {name}"))
        })
}

/// Extract the Authorization header value, or fail with the generic
/// no-scheme rejection.
pub fn authorization_header(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ApiError::unauthorized("Please authenticate with a supported scheme")
        })
}

/// Extract the token from a `Bearer` authorization value
pub fn bearer_token(authorization: &str) -> Result<&str, ApiError> {
    authorization.strip_prefix("Bearer ").map(str::trim).ok_or_else(|| {
        ApiError::auth_error(
            "AUTH_INVALID_TOKEN",
            "Authorization header must use Bearer scheme",
        )
    })
}

/// Read a boolean request flag header (`1`, `true`, `yes`).
pub fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
