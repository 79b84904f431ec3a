//! Platform integrity exchange endpoint.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ApiError;
use crate::state::AppState;

/// Exchange request: an opaque integrity token plus the user id the
/// client bound into it.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct IntegrityExchangeRequest {
    pub integrity_token: String,
    pub user_id: String,
}

/// Exchange response: a locally issued bearer token for the completion
/// endpoint.
#[derive(Serialize, utoipa::ToSchema)]
pub struct IntegrityExchangeResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

/// POST /verify/integrity - Exchange an integrity verdict for an access token
///
/// The integrity token is decoded by the remote oracle; the verdict must
/// name the configured package, bind `SHA256(user_id)`, and pass app and
/// device recognition. On success the gateway mints its own short-lived
/// access token.
#[utoipa::path(
    post,
    path = "/verify/integrity",
    tag = "Platform Integrity",
    request_body = IntegrityExchangeRequest,
    responses(
        (status = 200, description = "Access token issued", body = IntegrityExchangeResponse),
        (status = 401, description = "Integrity verdict rejected"),
        (status = 502, description = "Integrity oracle unreachable")
    )
)]
pub async fn verify_integrity_handler(
    State(state): State<AppState>,
    Json(request): Json<IntegrityExchangeRequest>,
) -> Result<Json<IntegrityExchangeResponse>, ApiError> {
    let payload = state.integrity.decode_token(&request.integrity_token).await?;

    let expected_hash = hex::encode(Sha256::digest(request.user_id.as_bytes()));
    state.integrity.validate_verdict(&payload, &expected_hash)?;

    let access_token = state.tokens.issue(&request.user_id)?;
    tracing::info!(user_id = %request.user_id, "Integrity verdict accepted, access token issued");

    Ok(Json(IntegrityExchangeResponse {
        access_token,
        token_type: "Bearer",
        expires_in: state.tokens.ttl_secs(),
    }))
}
