//! OAuth token introspection oracle client.
//!
//! The identity provider is an external collaborator: the gateway posts the
//! presented bearer token to the verification endpoint and trusts the
//! returned subject. Any failure, network or verdict, is a uniform 401.

use serde::Deserialize;

use crate::error::ApiError;

/// Introspection verdict from the identity provider.
#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    user: String,
    #[serde(default)]
    scope: Vec<String>,
}

/// OAuth token introspection client
pub struct OAuthVerifier {
    http_client: reqwest::Client,
    verify_url: String,
    required_scope: String,
}

impl OAuthVerifier {
    pub fn new(http_client: reqwest::Client, verify_url: String, required_scope: String) -> Self {
        Self {
            http_client,
            verify_url,
            required_scope,
        }
    }

    /// Introspect a bearer token and return the canonical subject.
    pub async fn verify(&self, token: &str) -> Result<String, ApiError> {
        let response = self
            .http_client
            .post(&self.verify_url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "OAuth introspection request failed");
                ApiError::auth_error("OAUTH_REJECTED", "Invalid OAuth token")
            })?;

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "OAuth introspection rejected token");
            return Err(ApiError::auth_error("OAUTH_REJECTED", "Invalid OAuth token"));
        }

        let verdict: IntrospectionResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "OAuth introspection returned malformed body");
            ApiError::auth_error("OAUTH_REJECTED", "Invalid OAuth token")
        })?;

        if !self.required_scope.is_empty()
            && !verdict.scope.iter().any(|s| s == &self.required_scope)
        {
            tracing::warn!(required = %self.required_scope, "OAuth token missing required scope");
            return Err(ApiError::auth_error("OAUTH_REJECTED", "Invalid OAuth token"));
        }

        Ok(verdict.user)
    }
}

impl std::fmt::Debug for OAuthVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthVerifier")
            .field("verify_url", &self.verify_url)
            .finish()
    }
}
