//! Keygate Core - device attestation protocol engine
//!
//! This crate implements the verification side of a platform device
//! attestation protocol:
//!
//! - Attestation objects (one-time enrollment proofs binding a fresh device
//!   key to an application identity via a manufacturer-rooted certificate
//!   chain and a challenge-derived nonce)
//! - Assertions (per-request proofs signed by an enrolled key, carrying a
//!   monotonic signing counter for replay detection)
//! - COSE public key decoding (EC2/P-256 only)
//!
//! Certificate chain validation is modeled as the [`trust::ChainVerifier`]
//! trait; [`trust::X509ChainVerifier`] is the OpenSSL-backed production
//! implementation and [`trust::InsecureChainVerifier`] exists for tests.
//! The crate performs no I/O: challenge persistence, counter storage and
//! the replay compare-and-update live with the caller.

pub mod assertion;
pub mod attestation;
pub mod authenticator;
pub mod cose;
pub mod error;
pub mod trust;

pub use assertion::{verify_assertion, Assertion};
pub use attestation::{
    attestation_nonce, verify_attestation, AttestationObject, EnrolledKey, ATTESTATION_FORMAT,
};
pub use authenticator::AuthenticatorData;
pub use cose::DevicePublicKey;
pub use error::{AttestError, Result};
pub use trust::{
    ChainVerifier, ChainVerifyRequest, InsecureChainVerifier, RootStore, X509ChainVerifier,
};
