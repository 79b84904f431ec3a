//! Application state module
//!
//! Defines shared state accessible across all request handlers. Everything
//! that used to be a process-wide lazily-initialized global (root CA bytes,
//! HTTP clients, token keys) is constructed once here at startup and passed
//! by reference.

use std::sync::Arc;
use std::time::Duration;

use keygate_core::trust::{ChainVerifier, InsecureChainVerifier, RootStore, X509ChainVerifier};

use crate::attest::AttestService;
use crate::auth::{OAuthVerifier, TokenIssuer};
use crate::completions::CompletionClient;
use crate::config::Config;
use crate::error::ApiError;
use crate::integrity::IntegrityVerifier;
use crate::storage::DeviceStore;

/// Application state containing shared resources.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Challenge and device key storage
    pub store: Arc<DeviceStore>,
    /// Device attestation service
    pub attest: Arc<AttestService>,
    /// OAuth introspection oracle client
    pub oauth: Arc<OAuthVerifier>,
    /// Platform integrity oracle client
    pub integrity: Arc<IntegrityVerifier>,
    /// Local access token issuer
    pub tokens: Arc<TokenIssuer>,
    /// Completion backend client
    pub upstream: Arc<CompletionClient>,
}

impl AppState {
    /// Build the full application state from configuration.
    pub async fn from_config(config: Config) -> Result<Self, ApiError> {
        let store = Arc::new(DeviceStore::from_config(&config).await?);

        let chain: Arc<dyn ChainVerifier> = if config.attest_insecure_chain {
            tracing::warn!(
                "Certificate chain verification is DISABLED - do not use in production!"
            );
            Arc::new(InsecureChainVerifier)
        } else {
            Arc::new(X509ChainVerifier)
        };

        let production_pem = match &config.attest_root_ca_path {
            Some(path) => std::fs::read(path).map_err(|e| {
                ApiError::internal(format!("Failed to read root CA at {path}: {e}"))
            })?,
            None if config.attest_insecure_chain => Vec::new(),
            None => {
                return Err(ApiError::internal(
                    "ATTEST_ROOT_CA_PATH is required when chain verification is enabled",
                ))
            }
        };
        let test_pem = match &config.attest_test_root_ca_path {
            Some(path) => Some(std::fs::read(path).map_err(|e| {
                ApiError::internal(format!("Failed to read test root CA at {path}: {e}"))
            })?),
            None => None,
        };
        let roots = Arc::new(RootStore::new(production_pem, test_pem));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upstream_timeout_secs))
            .build()
            .map_err(|e| ApiError::internal(format!("Failed to build HTTP client: {e}")))?;

        let attest = Arc::new(AttestService::new(
            store.clone(),
            roots,
            chain,
            config.app_identity(),
            config.attest_production,
            config.challenge_ttl_secs,
        ));
        let oauth = Arc::new(OAuthVerifier::new(
            http_client.clone(),
            config.oauth_verify_url.clone(),
            config.oauth_required_scope.clone(),
        ));
        let integrity = Arc::new(IntegrityVerifier::new(
            http_client.clone(),
            config.integrity_decode_url.clone(),
            config.integrity_api_key.clone(),
            config.integrity_package_name.clone(),
        ));
        let tokens = Arc::new(TokenIssuer::new(
            &config.access_token_secret,
            config.access_token_ttl_secs,
        ));
        let upstream = Arc::new(CompletionClient::new(http_client, &config));

        Ok(Self {
            config: Arc::new(config),
            store,
            attest,
            oauth,
            integrity,
            tokens,
            upstream,
        })
    }
}
