//! Connections to the realtime speech model.
//!
//! The call session only sees a [`ModelLink`]: a sender for client events and
//! a receiver of raw text frames. Socket pumping lives in the connector so the
//! session can be driven by plain channels in tests.

pub mod openai;

use async_trait::async_trait;
use callbridge_core::realtime_api::ClientEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Model frames the socket reader may queue ahead of the call loop.
pub(crate) const CHANNEL_BUFFER_SIZE: usize = 256;

/// A frame read from the model socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelFrame {
    Text(String),
    /// The socket closed or failed; carries the reason when there is one.
    Closed(Option<String>),
}

/// An open model connection.
#[derive(Debug)]
pub struct ModelLink {
    pub outgoing: mpsc::UnboundedSender<ClientEvent>,
    pub incoming: mpsc::Receiver<ModelFrame>,
}

/// Opens model connections for call sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Connects and starts pumping frames. The connection is closed once
    /// `cancel` fires or the link is dropped.
    async fn connect(&self, cancel: CancellationToken) -> anyhow::Result<ModelLink>;
}
