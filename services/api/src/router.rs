//! Axum Router Configuration

use crate::{handlers, state::AppState, ws::media_stream_handler};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/voice", post(handlers::voice_webhook))
        .route("/media-stream", get(media_stream_handler))
        .with_state(app_state)
}
