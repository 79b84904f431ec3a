//! Device attestation service
//!
//! Owns the challenge lifecycle and drives enrollment and per-request
//! assertion verification against the storage layer. Verification failures
//! are collapsed into a single generic message per operation; the internal
//! cause is only ever logged.

use std::sync::Arc;

use rand::RngCore;
use subtle::ConstantTimeEq;

use keygate_core::trust::{ChainVerifier, RootStore};
use keygate_core::{verify_assertion, verify_attestation, DevicePublicKey};

use crate::error::ApiError;
use crate::storage::{ChallengeRecord, DeviceStore};

/// Bytes of entropy in a challenge (hex-encoded on the wire).
const CHALLENGE_ENTROPY_BYTES: usize = 32;

/// Device attestation service
pub struct AttestService {
    store: Arc<DeviceStore>,
    roots: Arc<RootStore>,
    chain: Arc<dyn ChainVerifier>,
    app_identity: String,
    production: bool,
    challenge_ttl_secs: i64,
}

impl AttestService {
    pub fn new(
        store: Arc<DeviceStore>,
        roots: Arc<RootStore>,
        chain: Arc<dyn ChainVerifier>,
        app_identity: String,
        production: bool,
        challenge_ttl_secs: i64,
    ) -> Self {
        Self {
            store,
            roots,
            chain,
            app_identity,
            production,
            challenge_ttl_secs,
        }
    }

    fn is_expired(&self, record: &ChallengeRecord) -> bool {
        let age = chrono::Utc::now().signed_duration_since(record.created_at);
        age.num_seconds() > self.challenge_ttl_secs
    }

    /// Issue a challenge for a device key.
    ///
    /// Idempotent under retry: while an unexpired challenge exists for the
    /// key, the same value is returned unchanged.
    pub async fn issue_challenge(&self, key_id: &str) -> Result<String, ApiError> {
        if let Some(existing) = self.store.get_challenge(key_id).await? {
            if !self.is_expired(&existing) {
                return Ok(existing.value);
            }
        }

        let mut entropy = [0u8; CHALLENGE_ENTROPY_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut entropy);
        let value = hex::encode(entropy);

        self.store.upsert_challenge(key_id, &value).await?;
        tracing::debug!(key_id = %key_id, "Challenge issued");
        Ok(value)
    }

    /// Consume the outstanding challenge for a key and validate the
    /// presented value.
    ///
    /// The stored challenge is deleted on read regardless of the outcome;
    /// a challenge can be attempted exactly once. Absence, expiry and
    /// mismatch all return `false`.
    pub async fn consume_and_validate(
        &self,
        key_id: &str,
        provided: &[u8],
    ) -> Result<bool, ApiError> {
        let stored = self.store.get_challenge(key_id).await?;
        self.store.delete_challenge(key_id).await?;

        let Some(stored) = stored else {
            return Ok(false);
        };
        if self.is_expired(&stored) {
            tracing::warn!(key_id = %key_id, "Expired challenge presented");
            return Ok(false);
        }

        Ok(stored.value.as_bytes().ct_eq(provided).into())
    }

    /// Enroll a device key from an attestation object.
    ///
    /// The caller has already consumed the challenge; `challenge` is the
    /// raw value the device committed to. Every verification failure maps
    /// to the same generic error.
    pub async fn enroll(
        &self,
        key_id: &str,
        key_id_raw: &[u8],
        challenge: &[u8],
        attestation: &[u8],
        use_test_root: bool,
    ) -> Result<(), ApiError> {
        let root_ca = self.roots.select(use_test_root);

        let enrolled = verify_attestation(
            attestation,
            challenge,
            key_id_raw,
            &self.app_identity,
            self.production,
            root_ca,
            self.chain.as_ref(),
        )
        .map_err(|e| {
            tracing::error!(key_id = %key_id, error = %e, "Attestation verification failed");
            ApiError::forbidden("Attestation verification failed")
        })?;

        self.store
            .upsert_device_key(key_id, &enrolled.public_key.to_base64(), enrolled.counter)
            .await?;

        tracing::info!(key_id = %key_id, counter = enrolled.counter, "Device key enrolled");
        Ok(())
    }

    /// Authenticate a per-request assertion from an enrolled device key.
    ///
    /// Enforces the monotonic replay counter: the assertion's counter must
    /// strictly exceed the stored counter, and of two concurrent assertions
    /// only the winner of the conditional counter write succeeds.
    pub async fn authenticate(
        &self,
        key_id: &str,
        assertion: &[u8],
        expected_hash: &[u8; 32],
    ) -> Result<(), ApiError> {
        let Some(record) = self.store.get_device_key(key_id).await? else {
            tracing::error!(key_id = %key_id, "Assertion from unenrolled key");
            return Err(ApiError::forbidden("Assertion verification failed"));
        };

        let public_key = DevicePublicKey::from_base64(&record.public_key).map_err(|e| {
            tracing::error!(key_id = %key_id, error = %e, "Stored public key is unreadable");
            ApiError::forbidden("Assertion verification failed")
        })?;

        let counter = verify_assertion(assertion, expected_hash, &public_key, &self.app_identity)
            .map_err(|e| {
                tracing::error!(key_id = %key_id, error = %e, "Assertion verification failed");
                ApiError::forbidden("Assertion verification failed")
            })?;

        if counter <= record.counter {
            tracing::error!(
                key_id = %key_id,
                incoming = counter,
                stored = record.counter,
                "Assertion counter replay detected"
            );
            return Err(ApiError::forbidden("Assertion verification failed"));
        }

        if !self.store.advance_counter(key_id, counter).await? {
            // A concurrent assertion won the conditional write.
            tracing::warn!(
                key_id = %key_id,
                incoming = counter,
                "Assertion counter lost conditional update race"
            );
            return Err(ApiError::forbidden("Assertion verification failed"));
        }

        Ok(())
    }
}

impl std::fmt::Debug for AttestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestService")
            .field("app_identity", &self.app_identity)
            .field("production", &self.production)
            .field("challenge_ttl_secs", &self.challenge_ttl_secs)
            .finish()
    }
}
