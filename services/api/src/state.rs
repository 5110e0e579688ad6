//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the configuration,
//! the session registry and the model connector shared by all handlers.

use crate::{config::Config, registry::SessionRegistry, ws::provider::RealtimeConnector};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<dyn RealtimeConnector>,
}
