//! HTTP request handlers
//!
//! This module contains all the request handlers for the API endpoints.

pub mod completions;
pub mod device;
pub mod health;
pub mod integrity;

pub use completions::chat_completions_handler;
pub use device::{attest_handler, challenge_handler, AttestResponse, ChallengeResponse};
pub use health::{health, ready, HealthResponse, ReadyResponse};
pub use integrity::{
    verify_integrity_handler, IntegrityExchangeRequest, IntegrityExchangeResponse,
};
