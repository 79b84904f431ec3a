//! Keygate Server - authorization gateway binary
//!
//! Loads configuration from the environment, connects storage, and serves
//! the gateway until interrupted.

use keygate_server::{create_router, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let addr = config.socket_addr();

    let app = match create_router(config).await {
        Ok(router) => router,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start gateway");
            std::process::exit(1);
        }
    };

    tracing::info!("Keygate listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received");
}
