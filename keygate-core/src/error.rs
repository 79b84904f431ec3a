use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttestError {
    #[error("malformed authenticator data: {0}")]
    MalformedAuthenticatorData(String),

    #[error("malformed attestation object: {0}")]
    MalformedAttestation(String),

    #[error("malformed assertion: {0}")]
    MalformedAssertion(String),

    #[error("unsupported public key: {0}")]
    UnsupportedKey(String),

    #[error("certificate chain verification failed: {0}")]
    ChainVerification(String),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("relying party hash mismatch")]
    RelyingPartyMismatch,

    #[error("key identifier does not match attested credential")]
    KeyBindingMismatch,

    #[error("attestation environment mismatch")]
    EnvironmentMismatch,
}

pub type Result<T> = std::result::Result<T, AttestError>;
