//! Call relay core.
//!
//! Everything in this crate is free of network I/O: wire envelopes for the
//! telephony media stream and the realtime speech model, the readiness latch,
//! the turn-taking state machine, and the per-call `Relay` dispatcher that ties
//! them together. The service crate feeds socket frames in and writes the
//! resulting outbox back out.

pub mod audio;
pub mod error;
pub mod readiness;
pub mod realtime_api;
pub mod relay;
pub mod telephony;
pub mod turn;

pub use error::{CloseReason, RelayError};
pub use relay::{Flow, Outbound, Relay, RelaySettings, RelayStats};
