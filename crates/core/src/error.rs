//! Error taxonomy and close reasons for a relayed call.

use std::{fmt, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A frame that is not JSON or does not match the expected envelope.
    #[error("malformed {channel} message: {reason}")]
    MalformedMessage {
        channel: &'static str,
        reason: String,
    },
    /// The model rejected the session or a credential is missing.
    #[error("upstream configuration error: {0}")]
    UpstreamConfig(String),
    /// One of the two sockets failed or closed.
    #[error("connection error: {0}")]
    Connection(String),
    /// Too much audio piled up before the model became ready.
    #[error("readiness buffer overflow: {buffered:?} buffered, cap {cap:?}")]
    BufferOverflow { buffered: Duration, cap: Duration },
}

impl RelayError {
    pub fn malformed(channel: &'static str, reason: impl ToString) -> Self {
        RelayError::MalformedMessage {
            channel,
            reason: reason.to_string(),
        }
    }

    /// Malformed frames are dropped; everything else ends the call.
    pub fn is_fatal(&self) -> bool {
        self.close_reason().is_some()
    }

    /// The teardown reason for a fatal error.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            RelayError::MalformedMessage { .. } => None,
            RelayError::UpstreamConfig(_) => Some(CloseReason::HandshakeRejected),
            RelayError::Connection(_) => Some(CloseReason::ModelClosed),
            RelayError::BufferOverflow { .. } => Some(CloseReason::BufferOverflow),
        }
    }
}

/// Why a call session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The telephony side sent `stop`.
    TelephonyStop,
    /// The telephony socket closed or errored.
    TelephonyClosed,
    /// The model socket closed or errored mid-call.
    ModelClosed,
    /// The model socket could not be opened.
    ModelUnavailable,
    /// The model rejected the session handshake.
    HandshakeRejected,
    /// The readiness buffer hit its cap.
    BufferOverflow,
    /// The process is shutting down.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::TelephonyStop => "telephony-stop",
            CloseReason::TelephonyClosed => "telephony-closed",
            CloseReason::ModelClosed => "model-closed",
            CloseReason::ModelUnavailable => "model-unavailable",
            CloseReason::HandshakeRejected => "handshake-rejected",
            CloseReason::BufferOverflow => "buffer-overflow",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(!RelayError::malformed("telephony", "eof").is_fatal());
        assert!(RelayError::UpstreamConfig("rejected".into()).is_fatal());
        assert!(RelayError::Connection("reset".into()).is_fatal());
        let overflow = RelayError::BufferOverflow {
            buffered: Duration::from_millis(5020),
            cap: Duration::from_millis(5000),
        };
        assert!(overflow.is_fatal());
        assert_eq!(overflow.close_reason(), Some(CloseReason::BufferOverflow));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            RelayError::malformed("model", "expected value").to_string(),
            "malformed model message: expected value"
        );
        assert_eq!(CloseReason::TelephonyStop.to_string(), "telephony-stop");
    }
}
