//! Device attestation endpoints: challenge issuance and enrollment.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::{parse_carrier_claims, AttestationClaims, HEADER_USE_TEST_ROOT};
use crate::error::ApiError;
use crate::state::AppState;
use crate::util::{authorization_header, b64decode_safe, header_flag};

/// Query parameters for challenge issuance
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ChallengeQuery {
    /// Opaque device key identifier
    pub key_id: String,
}

/// Challenge issuance response
#[derive(Serialize, utoipa::ToSchema)]
pub struct ChallengeResponse {
    /// Single-use random value the device must embed in its signed proof
    pub challenge: String,
}

/// GET /challenge - Issue a challenge for a device key
///
/// Idempotent while an unexpired challenge exists for the key: retries
/// receive the same value.
#[utoipa::path(
    get,
    path = "/challenge",
    tag = "Device Attestation",
    params(ChallengeQuery),
    responses(
        (status = 200, description = "Challenge issued", body = ChallengeResponse),
        (status = 400, description = "Missing key_id")
    )
)]
pub async fn challenge_handler(
    State(state): State<AppState>,
    Query(query): Query<ChallengeQuery>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    if query.key_id.is_empty() {
        return Err(ApiError::bad_request("Missing key_id"));
    }

    let challenge = state.attest.issue_challenge(&query.key_id).await?;
    Ok(Json(ChallengeResponse { challenge }))
}

/// Enrollment response
#[derive(Serialize, utoipa::ToSchema)]
pub struct AttestResponse {
    pub status: &'static str,
}

/// POST /attest - Enroll a device key from an attestation object
///
/// The bearer credential is a carrier token whose payload holds
/// `{key_id, challenge, attestation_object, app_binding_id}`. The
/// challenge is consumed regardless of the outcome; a bad or expired
/// challenge is a 401, an invalid attestation a 403.
#[utoipa::path(
    post,
    path = "/attest",
    tag = "Device Attestation",
    responses(
        (status = 201, description = "Device key enrolled", body = AttestResponse),
        (status = 401, description = "Invalid or expired challenge"),
        (status = 403, description = "Attestation verification failed")
    )
)]
pub async fn attest_handler(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<(StatusCode, Json<AttestResponse>), ApiError> {
    let authorization = authorization_header(&headers)?;
    let claims: AttestationClaims = parse_carrier_claims(authorization)?;

    let challenge = b64decode_safe(&claims.challenge, "challenge")?;
    if !state
        .attest
        .consume_and_validate(&claims.key_id, &challenge)
        .await?
    {
        return Err(ApiError::unauthorized("Invalid or expired challenge"));
    }

    if let Some(binding) = &claims.app_binding_id {
        if binding != &state.config.app_bundle_id {
            tracing::warn!(
                claimed = %binding,
                configured = %state.config.app_bundle_id,
                "Attestation carrier names a different app binding"
            );
        }
    }

    let key_id_raw = b64decode_safe(&claims.key_id, "key_id")?;
    let attestation = b64decode_safe(&claims.attestation_object, "attestation_object")?;
    let use_test_root =
        header_flag(&headers, HEADER_USE_TEST_ROOT) && state.config.attest_allow_test_root;

    state
        .attest
        .enroll(
            &claims.key_id,
            &key_id_raw,
            &challenge,
            &attestation,
            use_test_root,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(AttestResponse { status: "success" })))
}
