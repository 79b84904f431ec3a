//! Router configuration module
//!
//! Configures all routes, middleware layers, and creates the application router.

use std::{sync::Arc, time::Duration};

use axum::{
    http::{header, Method, StatusCode},
    routing::{get, post},
    Router,
};
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::ApiError;
use crate::handlers::{
    attest_handler, challenge_handler, chat_completions_handler, health, ready,
    verify_integrity_handler,
};
use crate::state::AppState;

/// Create the application router from configuration
pub async fn create_router(config: Config) -> Result<Router, ApiError> {
    let rate_limit_enabled = config.rate_limit_enabled;
    let rate_limit_per_sec = config.rate_limit_per_sec;
    let rate_limit_burst = config.rate_limit_burst;

    let state = AppState::from_config(config).await?;
    Ok(build_router(
        state,
        rate_limit_enabled,
        rate_limit_per_sec,
        rate_limit_burst,
    ))
}

/// Create the application router from prepared state (used by tests)
pub fn create_router_with_state(state: AppState) -> Router {
    let rate_limit_enabled = state.config.rate_limit_enabled;
    let rate_limit_per_sec = state.config.rate_limit_per_sec;
    let rate_limit_burst = state.config.rate_limit_burst;
    build_router(
        state,
        rate_limit_enabled,
        rate_limit_per_sec,
        rate_limit_burst,
    )
}

fn build_router(
    state: AppState,
    rate_limit_enabled: bool,
    rate_limit_per_sec: u64,
    rate_limit_burst: u32,
) -> Router {
    // Configure CORS based on allowed_origins
    let cors = match &state.config.allowed_origins {
        Some(origins) if !origins.is_empty() => {
            let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            tracing::info!("CORS: Restricting to {} origin(s)", origins.len());
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION])
        }
        _ => {
            tracing::warn!("CORS: Allowing all origins (dev mode)");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    // Request body limit
    let body_limit = RequestBodyLimitLayer::new(state.config.body_limit_mb * 1024 * 1024);

    // Request timeout; never shorter than the upstream timeout
    let timeout_secs = state
        .config
        .timeout_secs
        .max(state.config.upstream_timeout_secs);
    let timeout = TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        Duration::from_secs(timeout_secs),
    );

    // Base router with common layers
    let router = Router::new()
        .route("/challenge", get(challenge_handler))
        .route("/attest", post(attest_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/verify/integrity", post(verify_integrity_handler))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .layer(cors)
        .layer(body_limit)
        .layer(timeout)
        .with_state(state);

    // Conditionally apply rate limiting (disabled in tests, enabled in production)
    if rate_limit_enabled {
        let governor_conf = GovernorConfigBuilder::default()
            .per_second(rate_limit_per_sec)
            .burst_size(rate_limit_burst)
            .finish()
            .expect("Failed to build rate limiter config");

        tracing::info!(
            "Rate limiting: {} req/s (burst: {})",
            rate_limit_per_sec,
            rate_limit_burst
        );

        router
            .layer(GovernorLayer::new(Arc::new(governor_conf)))
            .layer(TraceLayer::new_for_http())
    } else {
        tracing::warn!("Rate limiting: DISABLED");
        router.layer(TraceLayer::new_for_http())
    }
}
