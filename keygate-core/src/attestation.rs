//! Attestation object verification (device key enrollment).
//!
//! An attestation object is a signed CBOR bundle `{fmt, attStmt, authData}`
//! produced by the device when a key is generated. Verifying it binds the
//! key to the issuing application: the certificate chain must root in the
//! configured CA and the leaf nonce must commit to the issued challenge.

use ciborium::value::Value;
use sha2::{Digest, Sha256};

use crate::authenticator::{
    self, AuthenticatorData, ENVIRONMENT_DEVELOPMENT, ENVIRONMENT_PRODUCTION,
};
use crate::error::{AttestError, Result};
use crate::trust::{ChainVerifier, ChainVerifyRequest};

/// Statement format expected from the device attestation service.
pub const ATTESTATION_FORMAT: &str = "apple-appattest";

/// Decoded attestation object envelope.
#[derive(Debug, Clone)]
pub struct AttestationObject {
    pub format: String,
    /// DER certificate chain, leaf first.
    pub certificates: Vec<Vec<u8>>,
    pub auth_data: Vec<u8>,
}

impl AttestationObject {
    /// Decode the CBOR envelope `{fmt, attStmt: {x5c}, authData}`.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        let value: Value = ciborium::from_reader(bytes)
            .map_err(|e| AttestError::MalformedAttestation(format!("invalid CBOR: {e}")))?;
        let map = value
            .as_map()
            .ok_or_else(|| AttestError::MalformedAttestation("not a CBOR map".into()))?;

        let format = text_entry(map, "fmt")?;
        let auth_data = bytes_entry(map, "authData")?.to_vec();

        let statement = entry(map, "attStmt")
            .and_then(Value::as_map)
            .ok_or_else(|| AttestError::MalformedAttestation("missing attStmt".into()))?;
        let chain = entry(statement, "x5c")
            .and_then(Value::as_array)
            .ok_or_else(|| AttestError::MalformedAttestation("missing x5c chain".into()))?;

        let certificates = chain
            .iter()
            .map(|cert| {
                cert.as_bytes()
                    .map(|b| b.to_vec())
                    .ok_or_else(|| AttestError::MalformedAttestation("x5c entry is not bytes".into()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            format,
            certificates,
            auth_data,
        })
    }
}

/// Outcome of a successful enrollment verification.
#[derive(Debug, Clone)]
pub struct EnrolledKey {
    pub public_key: crate::cose::DevicePublicKey,
    pub counter: u32,
    pub credential_id: Vec<u8>,
}

/// Nonce the leaf certificate must embed:
/// `SHA256(authenticatorData || SHA256(challenge))`.
pub fn attestation_nonce(auth_data: &[u8], challenge: &[u8]) -> [u8; 32] {
    let challenge_hash = Sha256::digest(challenge);
    let mut hasher = Sha256::new();
    hasher.update(auth_data);
    hasher.update(challenge_hash);
    hasher.finalize().into()
}

/// Verify an attestation object and extract the enrolled key material.
///
/// `key_id` is the raw device key identifier; `app_identity` is the
/// `team.bundle` identity the key must be bound to. Chain and nonce
/// validation are delegated to the [`ChainVerifier`] primitive.
pub fn verify_attestation(
    attestation: &[u8],
    challenge: &[u8],
    key_id: &[u8],
    app_identity: &str,
    production: bool,
    root_ca_pem: &[u8],
    verifier: &dyn ChainVerifier,
) -> Result<EnrolledKey> {
    let object = AttestationObject::from_cbor(attestation)?;
    if object.format != ATTESTATION_FORMAT {
        return Err(AttestError::MalformedAttestation(format!(
            "unexpected statement format {:?}",
            object.format
        )));
    }

    let expected_nonce = attestation_nonce(&object.auth_data, challenge);
    verifier.verify_chain(&ChainVerifyRequest {
        key_id,
        app_identity,
        root_ca_pem,
        production,
        certificates: &object.certificates,
        expected_nonce,
    })?;

    let parsed: AuthenticatorData = authenticator::parse(&object.auth_data)?;

    let app_hash: [u8; 32] = Sha256::digest(app_identity.as_bytes()).into();
    if parsed.rp_id_hash != app_hash {
        return Err(AttestError::RelyingPartyMismatch);
    }

    if production {
        if parsed.environment != ENVIRONMENT_PRODUCTION {
            return Err(AttestError::EnvironmentMismatch);
        }
    } else if parsed.environment != ENVIRONMENT_PRODUCTION
        && parsed.environment != ENVIRONMENT_DEVELOPMENT
    {
        return Err(AttestError::EnvironmentMismatch);
    }

    // The key identifier must be both the attested credential id and the
    // digest of the enrolled public key.
    if parsed.credential_id != key_id {
        return Err(AttestError::KeyBindingMismatch);
    }
    let key_digest: [u8; 32] = Sha256::digest(parsed.public_key.as_sec1_bytes()).into();
    if key_digest.as_slice() != key_id {
        return Err(AttestError::KeyBindingMismatch);
    }

    Ok(EnrolledKey {
        public_key: parsed.public_key,
        counter: parsed.counter,
        credential_id: parsed.credential_id,
    })
}

fn entry<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find_map(|(k, v)| k.as_text().and_then(|t| (t == key).then_some(v)))
}

fn text_entry(map: &[(Value, Value)], key: &str) -> Result<String> {
    entry(map, key)
        .and_then(Value::as_text)
        .map(str::to_owned)
        .ok_or_else(|| AttestError::MalformedAttestation(format!("missing {key}")))
}

fn bytes_entry<'a>(map: &'a [(Value, Value)], key: &str) -> Result<&'a [u8]> {
    entry(map, key)
        .and_then(Value::as_bytes)
        .map(Vec::as_slice)
        .ok_or_else(|| AttestError::MalformedAttestation(format!("missing {key}")))
}
