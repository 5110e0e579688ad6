//! WebSocket call relay.
//!
//! - `telephony`: the media-stream endpoint and its socket pumps.
//! - `provider`: connections to the realtime speech model.
//! - `session`: call lifecycle and the per-call event loop.

pub mod provider;
pub mod session;
pub mod telephony;

pub use telephony::media_stream_handler;
