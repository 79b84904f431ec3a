//! Platform integrity verification.
//!
//! The integrity token itself is opaque to the gateway: a remote oracle
//! decodes it and returns a verdict payload. The gateway validates the
//! verdict (package binding, request hash, app and device recognition)
//! and, on success, the caller exchanges it for a locally issued access
//! token.

use serde::Deserialize;

use crate::error::ApiError;

/// Device recognition verdicts accepted by the gateway.
pub const ALLOWED_DEVICE_VERDICTS: [&str; 3] = [
    "MEETS_DEVICE_INTEGRITY",
    "MEETS_BASIC_INTEGRITY",
    "MEETS_STRONG_INTEGRITY",
];

/// App recognition verdict required for a trusted install.
const APP_RECOGNIZED: &str = "PLAY_RECOGNIZED";

#[derive(Debug, Deserialize)]
struct VerdictEnvelope {
    #[serde(rename = "tokenPayloadExternal")]
    token_payload_external: Option<VerdictPayload>,
    #[serde(rename = "tokenPayload")]
    token_payload: Option<VerdictPayload>,
}

/// Decoded verdict payload returned by the integrity oracle.
#[derive(Debug, Default, Deserialize)]
pub struct VerdictPayload {
    #[serde(rename = "requestDetails", default)]
    request_details: RequestDetails,
    #[serde(rename = "appIntegrity", default)]
    app_integrity: AppIntegrity,
    #[serde(rename = "deviceIntegrity", default)]
    device_integrity: DeviceIntegrity,
}

#[derive(Debug, Default, Deserialize)]
struct RequestDetails {
    #[serde(rename = "requestPackageName")]
    request_package_name: Option<String>,
    #[serde(rename = "requestHash")]
    request_hash: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AppIntegrity {
    #[serde(rename = "appRecognitionVerdict")]
    app_recognition_verdict: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceIntegrity {
    #[serde(rename = "deviceRecognitionVerdict", default)]
    device_recognition_verdict: Vec<String>,
}

/// Client for the platform integrity oracle.
pub struct IntegrityVerifier {
    http_client: reqwest::Client,
    decode_url: String,
    api_key: String,
    package_name: String,
}

impl IntegrityVerifier {
    pub fn new(
        http_client: reqwest::Client,
        decode_url: String,
        api_key: String,
        package_name: String,
    ) -> Self {
        Self {
            http_client,
            decode_url,
            api_key,
            package_name,
        }
    }

    /// Decode an integrity token via the remote oracle.
    pub async fn decode_token(&self, integrity_token: &str) -> Result<VerdictPayload, ApiError> {
        let response = self
            .http_client
            .post(&self.decode_url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "integrity_token": integrity_token }))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Integrity oracle unreachable");
                ApiError::ProxyFailure("Integrity validation service unavailable".to_string())
            })?;

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "Integrity oracle rejected token");
            return Err(ApiError::auth_error(
                "INTEGRITY_REJECTED",
                "Invalid integrity token",
            ));
        }

        let envelope: VerdictEnvelope = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Integrity oracle returned malformed body");
            ApiError::auth_error("INTEGRITY_REJECTED", "Invalid integrity token")
        })?;

        envelope
            .token_payload_external
            .or(envelope.token_payload)
            .ok_or_else(|| {
                ApiError::auth_error("INTEGRITY_REJECTED", "Invalid integrity token")
            })
    }

    /// Validate a decoded verdict against the expected request binding.
    ///
    /// `expected_hash` is the hex SHA-256 of the user id the client claims
    /// to have bound into the token.
    pub fn validate_verdict(
        &self,
        payload: &VerdictPayload,
        expected_hash: &str,
    ) -> Result<(), ApiError> {
        if let Some(package) = &payload.request_details.request_package_name {
            if package != &self.package_name {
                tracing::warn!(package = %package, "Integrity verdict names wrong package");
                return Err(ApiError::auth_error(
                    "INTEGRITY_REJECTED",
                    "Invalid package name",
                ));
            }
        }

        if payload.request_details.request_hash.as_deref() != Some(expected_hash) {
            tracing::warn!("Integrity verdict request hash mismatch");
            return Err(ApiError::auth_error(
                "INTEGRITY_REJECTED",
                "Invalid request hash",
            ));
        }

        if payload.app_integrity.app_recognition_verdict.as_deref() != Some(APP_RECOGNIZED) {
            tracing::warn!("Integrity verdict does not recognize the app");
            return Err(ApiError::auth_error(
                "INTEGRITY_REJECTED",
                "App not recognized",
            ));
        }

        let device_ok = payload
            .device_integrity
            .device_recognition_verdict
            .iter()
            .any(|verdict| ALLOWED_DEVICE_VERDICTS.contains(&verdict.as_str()));
        if !device_ok {
            tracing::warn!("Integrity verdict failed device recognition");
            return Err(ApiError::auth_error(
                "INTEGRITY_REJECTED",
                "Device integrity check failed",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for IntegrityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityVerifier")
            .field("decode_url", &self.decode_url)
            .field("package_name", &self.package_name)
            .finish()
    }
}
