//! OpenAPI documentation configuration
//!
//! Generates OpenAPI 3.0 specification for the Keygate authorization gateway.

use utoipa::OpenApi;

use crate::completions::ChatRequest;
use crate::handlers::{
    AttestResponse, ChallengeResponse, HealthResponse, IntegrityExchangeRequest,
    IntegrityExchangeResponse, ReadyResponse,
};

/// Keygate - OpenAPI Documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Keygate Authorization Gateway",
        version = "0.1.0",
        description = r#"
## Device/identity authorization gateway for LLM completions

Keygate sits in front of a completion backend and converts one of three
authentication proofs into a canonical, metered principal:

- **Device attestation** - hardware-backed challenge/response with
  monotonic replay protection
- **OAuth** - third-party bearer tokens verified against the identity
  provider's introspection endpoint
- **Platform integrity** - integrity verdicts exchanged for short-lived
  gateway-issued access tokens

Budget and rate-limit failures reported by the backend surface as
`429 {"error": <code>}` with a scheme-specific `Retry-After` header
(code 1 = budget, `86400`; code 2 = rate, `60`).
"#,
        license(name = "MIT OR Apache-2.0")
    ),
    tags(
        (name = "Device Attestation", description = "Challenge issuance and device key enrollment"),
        (name = "Platform Integrity", description = "Integrity verdict exchange for access tokens"),
        (name = "Completions", description = "Authorized completion proxy"),
        (name = "Health", description = "Service health and readiness endpoints")
    ),
    paths(
        crate::handlers::health::health,
        crate::handlers::health::ready,
        crate::handlers::device::challenge_handler,
        crate::handlers::device::attest_handler,
        crate::handlers::completions::chat_completions_handler,
        crate::handlers::integrity::verify_integrity_handler,
    ),
    components(
        schemas(
            HealthResponse,
            ReadyResponse,
            ChallengeResponse,
            AttestResponse,
            ChatRequest,
            IntegrityExchangeRequest,
            IntegrityExchangeResponse,
        )
    )
)]
pub struct ApiDoc;
