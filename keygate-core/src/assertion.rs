//! Assertion verification (per-request device proof).
//!
//! An assertion is a CBOR bundle `{signature, authenticatorData}` signed by
//! an enrolled device key. The signature covers
//! `SHA256(authenticatorData || expected_hash)` where `expected_hash` is the
//! digest of the request payload being authorized. The signing counter is
//! returned to the caller, which owns the monotonic replay check against
//! the stored record.

use ciborium::value::Value;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::Signature;
use sha2::{Digest, Sha256};

use crate::authenticator;
use crate::cose::DevicePublicKey;
use crate::error::{AttestError, Result};

/// Decoded assertion envelope.
#[derive(Debug, Clone)]
pub struct Assertion {
    pub signature: Vec<u8>,
    pub auth_data: Vec<u8>,
}

impl Assertion {
    /// Decode the CBOR envelope `{signature, authenticatorData}`.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        let value: Value = ciborium::from_reader(bytes)
            .map_err(|e| AttestError::MalformedAssertion(format!("invalid CBOR: {e}")))?;
        let map = value
            .as_map()
            .ok_or_else(|| AttestError::MalformedAssertion("not a CBOR map".into()))?;

        let signature = bytes_entry(map, "signature")?.to_vec();
        let auth_data = bytes_entry(map, "authenticatorData")?.to_vec();

        Ok(Self {
            signature,
            auth_data,
        })
    }
}

/// Verify an assertion against the stored device key and the digest of the
/// request payload. Returns the assertion's signing counter.
pub fn verify_assertion(
    assertion: &[u8],
    expected_hash: &[u8; 32],
    public_key: &DevicePublicKey,
    app_identity: &str,
) -> Result<u32> {
    let assertion = Assertion::from_cbor(assertion)?;

    let mut hasher = Sha256::new();
    hasher.update(&assertion.auth_data);
    hasher.update(expected_hash);
    let nonce: [u8; 32] = hasher.finalize().into();

    let signature = Signature::from_der(&assertion.signature)
        .or_else(|_| Signature::from_slice(&assertion.signature))
        .map_err(|_| AttestError::SignatureInvalid)?;
    public_key
        .verifying_key()?
        .verify(&nonce, &signature)
        .map_err(|_| AttestError::SignatureInvalid)?;

    let app_hash: [u8; 32] = Sha256::digest(app_identity.as_bytes()).into();
    if authenticator::parse_rp_id_hash(&assertion.auth_data)? != app_hash {
        return Err(AttestError::RelyingPartyMismatch);
    }

    authenticator::parse_counter(&assertion.auth_data)
}

fn bytes_entry<'a>(map: &'a [(Value, Value)], key: &str) -> Result<&'a [u8]> {
    map.iter()
        .find_map(|(k, v)| k.as_text().and_then(|t| (t == key).then_some(v)))
        .and_then(Value::as_bytes)
        .map(Vec::as_slice)
        .ok_or_else(|| AttestError::MalformedAssertion(format!("missing {key}")))
}
