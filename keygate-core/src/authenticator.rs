//! Authenticator data parsing.
//!
//! Layout (byte offsets): 32 bytes relying-party-id hash, 1 byte flags,
//! 4 bytes big-endian signing counter, 16 bytes environment identifier,
//! 2 bytes credential-id length, the credential id, then a COSE-encoded
//! public key. Assertions carry only the 37-byte prefix; attestations
//! carry the full attested-credential layout.

use crate::cose::{decode_cose_key, DevicePublicKey};
use crate::error::{AttestError, Result};

/// Environment identifier for production-issued keys.
pub const ENVIRONMENT_PRODUCTION: [u8; 16] = *b"appattest\x00\x00\x00\x00\x00\x00\x00";
/// Environment identifier for development-issued keys.
pub const ENVIRONMENT_DEVELOPMENT: [u8; 16] = *b"appattestdevelop";

/// Minimum length: rpIdHash + flags + counter.
const COUNTER_END: usize = 37;
/// Offset of the attested-credential section (environment id onwards).
const CREDENTIAL_SECTION: usize = COUNTER_END + 16;

/// Fully parsed authenticator data from an attestation.
#[derive(Debug, Clone)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: u8,
    pub counter: u32,
    pub environment: [u8; 16],
    pub credential_id: Vec<u8>,
    pub public_key: DevicePublicKey,
}

/// Parse only the signing counter (offset 33..37, big-endian u32).
///
/// This is the prefix shared by attestations and assertions.
pub fn parse_counter(data: &[u8]) -> Result<u32> {
    if data.len() < COUNTER_END {
        return Err(AttestError::MalformedAuthenticatorData(format!(
            "{} bytes, need at least {COUNTER_END}",
            data.len()
        )));
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[33..37]);
    Ok(u32::from_be_bytes(buf))
}

/// Parse the relying-party-id hash (first 32 bytes).
pub fn parse_rp_id_hash(data: &[u8]) -> Result<[u8; 32]> {
    if data.len() < 32 {
        return Err(AttestError::MalformedAuthenticatorData(format!(
            "{} bytes, need at least 32",
            data.len()
        )));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&data[..32]);
    Ok(hash)
}

/// Parse the full attested-credential layout.
pub fn parse(data: &[u8]) -> Result<AuthenticatorData> {
    let rp_id_hash = parse_rp_id_hash(data)?;
    let counter = parse_counter(data)?;

    if data.len() < CREDENTIAL_SECTION + 2 {
        return Err(AttestError::MalformedAuthenticatorData(
            "attested credential data truncated".into(),
        ));
    }

    let mut environment = [0u8; 16];
    environment.copy_from_slice(&data[COUNTER_END..CREDENTIAL_SECTION]);

    let cred_len =
        u16::from_be_bytes([data[CREDENTIAL_SECTION], data[CREDENTIAL_SECTION + 1]]) as usize;
    let cred_start = CREDENTIAL_SECTION + 2;
    let cred_end = cred_start + cred_len;
    if data.len() <= cred_end {
        return Err(AttestError::MalformedAuthenticatorData(
            "credential id overruns authenticator data".into(),
        ));
    }

    let credential_id = data[cred_start..cred_end].to_vec();
    let public_key = decode_cose_key(&data[cred_end..])?;

    Ok(AuthenticatorData {
        rp_id_hash,
        flags: data[32],
        counter,
        environment,
        credential_id,
        public_key,
    })
}
