//! Main Entrypoint for the Call Bridge Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Building the shared state: session registry and model connector.
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server and closing live calls on shutdown.

use anyhow::Context;
use callbridge_api::{
    config::Config, registry::SessionRegistry, router::create_router, state::AppState,
    ws::provider::openai::OpenAiConnector,
};
use callbridge_core::CloseReason;
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Waits for `Ctrl+C`, then closes every live call.
async fn shutdown_signal(registry: Arc<SessionRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        return;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
    let closed = registry.close_all(CloseReason::Shutdown);
    info!(closed, "Closed live calls");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared Services ---
    let connector = Arc::new(OpenAiConnector::new(
        config.realtime_endpoint(),
        config.openai_api_key.clone(),
    ));
    let registry = Arc::new(SessionRegistry::new());
    let bind_address = config.bind_address;
    info!(
        model = %config.realtime_model,
        audio_format = %config.audio_format,
        turn_detection = ?config.turn_detection,
        "Model connector configured"
    );

    let app_state = Arc::new(AppState {
        config: Arc::new(config),
        registry: registry.clone(),
        connector,
    });

    // --- 4. Create Router and Apply Middleware ---
    let app = create_router(app_state).layer(TraceLayer::new_for_http());

    // --- 5. Start Server ---
    info!(%bind_address, "Service configured. Starting server...");
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(registry))
    .await?;

    info!("Server has shut down.");
    Ok(())
}
