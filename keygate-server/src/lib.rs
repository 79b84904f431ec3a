//! Keygate Server - device/identity authorization gateway for LLM completions
//!
//! This library exposes the server components for use in integration tests.
//! The main binary uses these same components.

pub mod attest;
pub mod auth;
pub mod completions;
pub mod config;
pub mod error;
pub mod handlers;
pub mod integrity;
pub mod openapi;
pub mod routes;
pub mod state;
pub mod storage;
pub mod util;

pub use attest::AttestService;
pub use auth::{authorize, AuthScheme, Identity, OAuthVerifier, Principal, ServiceType, TokenIssuer};
pub use completions::{
    classify_limit_error, payload_hash, AuthorizedRequest, ChatRequest, CompletionClient, LimitKind,
};
pub use config::Config;
pub use error::ApiError;
pub use integrity::IntegrityVerifier;
pub use openapi::ApiDoc;
pub use routes::{create_router, create_router_with_state};
pub use state::AppState;
pub use storage::{DeviceKeyRecord, DeviceStore, StorageError};
