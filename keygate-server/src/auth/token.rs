//! Locally issued access tokens for the platform-integrity scheme.
//!
//! After a successful integrity verdict the gateway mints a short-lived
//! HS256 bearer token. Validity is purely a function of signature and
//! expiry at read time; nothing is persisted.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Issuer claim stamped into every access token.
const TOKEN_ISSUER: &str = "keygate";
/// Token type claim.
const TOKEN_TYPE: &str = "access";

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    sub: String,
    iat: u64,
    exp: u64,
    iss: String,
    typ: String,
}

/// Issues and validates the gateway's own access tokens.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: u64,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_secs,
        }
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Mint an access token for a verified subject.
    pub fn issue(&self, subject: &str) -> Result<String, ApiError> {
        let now = chrono::Utc::now().timestamp() as u64;
        let claims = AccessClaims {
            sub: subject.to_string(),
            iat: now,
            exp: now + self.ttl_secs,
            iss: TOKEN_ISSUER.to_string(),
            typ: TOKEN_TYPE.to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|e| {
            tracing::error!(error = %e, "Failed to sign access token");
            ApiError::internal("Failed to issue access token")
        })
    }

    /// Validate an access token and return its subject.
    pub fn validate(&self, token: &str) -> Result<String, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation.set_issuer(&[TOKEN_ISSUER]);

        let data = decode::<AccessClaims>(token, &self.decoding, &validation).map_err(|e| {
            tracing::warn!(error = %e, "Access token validation failed");
            ApiError::auth_error("AUTH_INVALID_TOKEN", "Invalid access token")
        })?;

        Ok(data.claims.sub)
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}
