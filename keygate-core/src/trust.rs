//! Root-of-trust selection and certificate chain verification.
//!
//! Chain verification is the external primitive of the protocol: given the
//! attestation's certificate chain and the expected nonce, an implementation
//! must validate the chain against the configured root CA and confirm the
//! leaf certificate's embedded nonce. The production implementation is
//! backed by OpenSSL; [`InsecureChainVerifier`] exists for tests only.

use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509StoreContext, X509};

use crate::error::{AttestError, Result};

/// ASN.1 DER encoding of the leaf nonce extension OID (1.2.840.113635.100.8.2).
const NONCE_EXTENSION_OID: [u8; 11] = [
    0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x63, 0x64, 0x08, 0x02,
];

/// Root CA material, loaded once at process startup and passed by reference.
///
/// Holds the production root and an optional test root. The test root is
/// only ever consulted when the caller explicitly selects it; when selected
/// but not configured, selection falls back to the production root.
#[derive(Debug, Clone)]
pub struct RootStore {
    production: Vec<u8>,
    test: Option<Vec<u8>>,
}

impl RootStore {
    pub fn new(production_pem: Vec<u8>, test_pem: Option<Vec<u8>>) -> Self {
        Self {
            production: production_pem,
            test: test_pem,
        }
    }

    /// Select root CA material. `use_test_root` picks the test root when one
    /// is configured.
    pub fn select(&self, use_test_root: bool) -> &[u8] {
        if use_test_root {
            match &self.test {
                Some(pem) => return pem,
                None => {
                    tracing::warn!(
                        "test root requested but not configured, falling back to production root"
                    );
                }
            }
        }
        &self.production
    }

    pub fn has_test_root(&self) -> bool {
        self.test.is_some()
    }
}

/// Parameters handed to the chain-verification primitive.
pub struct ChainVerifyRequest<'a> {
    /// Raw device key identifier.
    pub key_id: &'a [u8],
    /// Application identity the key must be bound to (`team.bundle`).
    pub app_identity: &'a str,
    /// PEM-encoded root CA selected for this verification.
    pub root_ca_pem: &'a [u8],
    /// Whether production-environment keys are required.
    pub production: bool,
    /// DER certificate chain from the attestation object, leaf first.
    pub certificates: &'a [Vec<u8>],
    /// `SHA256(authenticatorData || SHA256(challenge))`.
    pub expected_nonce: [u8; 32],
}

/// The chain-verification primitive.
///
/// Implementations must validate the certificate chain against the root CA
/// and confirm that the leaf certificate's embedded nonce equals
/// `expected_nonce`, erroring on any mismatch.
pub trait ChainVerifier: Send + Sync {
    fn verify_chain(&self, request: &ChainVerifyRequest<'_>) -> Result<()>;
}

/// OpenSSL-backed chain verifier.
pub struct X509ChainVerifier;

impl ChainVerifier for X509ChainVerifier {
    fn verify_chain(&self, request: &ChainVerifyRequest<'_>) -> Result<()> {
        let leaf_der = request
            .certificates
            .first()
            .ok_or_else(|| AttestError::ChainVerification("empty certificate chain".into()))?;

        let leaf = X509::from_der(leaf_der)
            .map_err(|e| AttestError::ChainVerification(format!("invalid leaf certificate: {e}")))?;

        let root = X509::from_pem(request.root_ca_pem)
            .map_err(|e| AttestError::ChainVerification(format!("invalid root CA: {e}")))?;
        let mut store = X509StoreBuilder::new()
            .map_err(|e| AttestError::ChainVerification(e.to_string()))?;
        store
            .add_cert(root)
            .map_err(|e| AttestError::ChainVerification(e.to_string()))?;
        let store = store.build();

        let mut intermediates =
            Stack::new().map_err(|e| AttestError::ChainVerification(e.to_string()))?;
        for der in &request.certificates[1..] {
            let cert = X509::from_der(der).map_err(|e| {
                AttestError::ChainVerification(format!("invalid intermediate certificate: {e}"))
            })?;
            intermediates
                .push(cert)
                .map_err(|e| AttestError::ChainVerification(e.to_string()))?;
        }

        let mut context =
            X509StoreContext::new().map_err(|e| AttestError::ChainVerification(e.to_string()))?;
        let (valid, reason) = context
            .init(&store, &leaf, &intermediates, |ctx| {
                let ok = ctx.verify_cert()?;
                Ok((ok, ctx.error()))
            })
            .map_err(|e| AttestError::ChainVerification(e.to_string()))?;
        if !valid {
            return Err(AttestError::ChainVerification(format!(
                "chain did not verify against root: {reason}"
            )));
        }

        let nonce = extract_nonce(leaf_der).ok_or_else(|| {
            AttestError::ChainVerification("leaf certificate has no nonce extension".into())
        })?;
        if nonce != request.expected_nonce {
            return Err(AttestError::ChainVerification(
                "leaf nonce does not match challenge binding".into(),
            ));
        }

        Ok(())
    }
}

/// Locate the nonce extension in the leaf certificate DER and return the
/// embedded 32-byte nonce.
///
/// The extension value is `OCTET STRING { SEQUENCE { [1] { OCTET STRING
/// nonce } } }` following the extension OID.
fn extract_nonce(leaf_der: &[u8]) -> Option<[u8; 32]> {
    let oid_at = leaf_der
        .windows(NONCE_EXTENSION_OID.len())
        .position(|w| w == NONCE_EXTENSION_OID)?;

    let mut pos = oid_at + NONCE_EXTENSION_OID.len();
    for expected_tag in [0x04u8, 0x30, 0xA1, 0x04] {
        let (tag, _, content) = read_tlv(leaf_der, pos)?;
        if tag != expected_tag {
            return None;
        }
        pos = content;
    }

    leaf_der.get(pos..pos + 32)?.try_into().ok()
}

/// Read one DER TLV header at `pos`, returning (tag, length, content offset).
fn read_tlv(data: &[u8], pos: usize) -> Option<(u8, usize, usize)> {
    let tag = *data.get(pos)?;
    let first = *data.get(pos + 1)?;
    if first < 0x80 {
        return Some((tag, first as usize, pos + 2));
    }
    let num_bytes = (first & 0x7F) as usize;
    if num_bytes == 0 || num_bytes > 4 {
        return None;
    }
    let mut length = 0usize;
    for i in 0..num_bytes {
        length = (length << 8) | *data.get(pos + 2 + i)? as usize;
    }
    Some((tag, length, pos + 2 + num_bytes))
}

/// Chain verifier that accepts any non-empty chain without validation.
/// WARNING: Do not use in production - performs no cryptographic checks!
pub struct InsecureChainVerifier;

impl ChainVerifier for InsecureChainVerifier {
    fn verify_chain(&self, request: &ChainVerifyRequest<'_>) -> Result<()> {
        if request.certificates.is_empty() {
            return Err(AttestError::ChainVerification("empty certificate chain".into()));
        }
        Ok(())
    }
}
