//! COSE key decoding for attested device credentials.
//!
//! Authenticator data carries the device public key as a compact CBOR map
//! (COSE_Key). Only EC2 keys on the P-256 curve are accepted; everything
//! else is rejected at enrollment time.

use ciborium::value::Value;
use p256::ecdsa::VerifyingKey;

use crate::error::{AttestError, Result};

/// COSE key type label (1) value for EC2 keys.
const COSE_KTY_EC2: i128 = 2;
/// COSE curve label (-1) value for P-256.
const COSE_CRV_P256: i128 = 1;

/// A device public key in a portable encoding.
///
/// Internally this is the SEC1 uncompressed point (`0x04 || x || y`,
/// 65 bytes). The base64 form is what gets persisted alongside the
/// device key record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePublicKey {
    sec1: Vec<u8>,
}

impl DevicePublicKey {
    /// Build a key from raw big-endian curve coordinates.
    pub fn from_coordinates(x: &[u8], y: &[u8]) -> Result<Self> {
        if x.len() != 32 || y.len() != 32 {
            return Err(AttestError::UnsupportedKey(format!(
                "expected 32-byte coordinates, got x={} y={}",
                x.len(),
                y.len()
            )));
        }

        let mut sec1 = Vec::with_capacity(65);
        sec1.push(0x04);
        sec1.extend_from_slice(x);
        sec1.extend_from_slice(y);

        // Validates that the coordinates form a point on the curve.
        VerifyingKey::from_sec1_bytes(&sec1)
            .map_err(|e| AttestError::UnsupportedKey(format!("invalid curve point: {e}")))?;

        Ok(Self { sec1 })
    }

    /// Rebuild a key from its SEC1 uncompressed encoding.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| AttestError::UnsupportedKey(format!("invalid SEC1 encoding: {e}")))?;
        Ok(Self {
            sec1: bytes.to_vec(),
        })
    }

    /// Rebuild a key from the persisted base64 form.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| AttestError::UnsupportedKey(format!("invalid base64: {e}")))?;
        Self::from_sec1_bytes(&bytes)
    }

    /// The persisted portable encoding (base64 of the SEC1 point).
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.sec1)
    }

    /// Raw SEC1 uncompressed point bytes.
    pub fn as_sec1_bytes(&self) -> &[u8] {
        &self.sec1
    }

    /// ECDSA verification key for this device key.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_sec1_bytes(&self.sec1)
            .map_err(|e| AttestError::UnsupportedKey(format!("invalid SEC1 encoding: {e}")))
    }
}

/// Decode a CBOR COSE_Key map into a [`DevicePublicKey`].
///
/// COSE key map for EC2 keys: 1=kty, -1=crv, -2=x, -3=y. Any key type or
/// curve other than EC2/P-256 is rejected.
pub fn decode_cose_key(bytes: &[u8]) -> Result<DevicePublicKey> {
    let value: Value = ciborium::from_reader(bytes)
        .map_err(|e| AttestError::UnsupportedKey(format!("invalid COSE key CBOR: {e}")))?;

    let map = value
        .as_map()
        .ok_or_else(|| AttestError::UnsupportedKey("COSE key is not a map".into()))?;

    let kty = map_integer(map, 1)
        .ok_or_else(|| AttestError::UnsupportedKey("COSE key missing kty".into()))?;
    let crv = map_integer(map, -1)
        .ok_or_else(|| AttestError::UnsupportedKey("COSE key missing crv".into()))?;

    if kty != COSE_KTY_EC2 || crv != COSE_CRV_P256 {
        return Err(AttestError::UnsupportedKey(format!(
            "public key is not a P-256 elliptic curve key (kty={kty}, crv={crv})"
        )));
    }

    let x = map_bytes(map, -2)
        .ok_or_else(|| AttestError::UnsupportedKey("COSE key missing x coordinate".into()))?;
    let y = map_bytes(map, -3)
        .ok_or_else(|| AttestError::UnsupportedKey("COSE key missing y coordinate".into()))?;

    DevicePublicKey::from_coordinates(x, y)
}

fn map_lookup<'a>(map: &'a [(Value, Value)], label: i128) -> Option<&'a Value> {
    map.iter().find_map(|(k, v)| {
        k.as_integer()
            .and_then(|i| (i128::from(i) == label).then_some(v))
    })
}

fn map_integer(map: &[(Value, Value)], label: i128) -> Option<i128> {
    map_lookup(map, label)
        .and_then(Value::as_integer)
        .map(i128::from)
}

fn map_bytes<'a>(map: &'a [(Value, Value)], label: i128) -> Option<&'a [u8]> {
    map_lookup(map, label)
        .and_then(Value::as_bytes)
        .map(Vec::as_slice)
}
