//! Call Bridge API Library Crate
//!
//! Everything the service needs besides the entrypoint: configuration,
//! shared state, the session registry, HTTP handlers, the WebSocket relay
//! and routing. The `callbridge` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws;
