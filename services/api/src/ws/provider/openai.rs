//! Handles the real-time WebSocket connection to OpenAI.

use super::{CHANNEL_BUFFER_SIZE, ModelFrame, ModelLink, RealtimeConnector};
use anyhow::{Context, Result};
use async_trait::async_trait;
use callbridge_core::realtime_api::ClientEvent;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use secrecy::{ExposeSecret, SecretString};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

type OpenAiSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the OpenAI Realtime API.
pub struct OpenAiConnector {
    endpoint: String,
    api_key: SecretString,
}

impl OpenAiConnector {
    pub fn new(endpoint: String, api_key: SecretString) -> Self {
        Self { endpoint, api_key }
    }
}

#[async_trait]
impl RealtimeConnector for OpenAiConnector {
    async fn connect(&self, cancel: CancellationToken) -> Result<ModelLink> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.api_key.expose_secret()).parse()?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse()?);

        let (ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to OpenAI Realtime WebSocket")?;
        let (openai_tx, openai_rx) = ws_stream.split();
        info!("Connected to OpenAI Realtime API.");

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming) = mpsc::channel(CHANNEL_BUFFER_SIZE);

        tokio::spawn(write_events(openai_tx, outgoing_rx, cancel.clone()).in_current_span());
        tokio::spawn(read_frames(openai_rx, incoming_tx, cancel).in_current_span());

        Ok(ModelLink { outgoing, incoming })
    }
}

async fn write_events(
    mut sink: SplitSink<OpenAiSocket, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<ClientEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, kind = event.kind(), "Failed to serialize model event");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                    warn!(error = %e, "Failed to send to OpenAI");
                    break;
                }
            }
        }
    }
    if let Err(e) = sink.send(WsMessage::Close(None)).await {
        debug!(error = %e, "OpenAI socket already closed");
    }
}

async fn read_frames(
    mut stream: SplitStream<OpenAiSocket>,
    tx: mpsc::Sender<ModelFrame>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = stream.next() => msg,
        };
        let frame = match msg {
            Some(Ok(WsMessage::Text(text))) => ModelFrame::Text(text.to_string()),
            Some(Ok(WsMessage::Close(close))) => {
                ModelFrame::Closed(close.map(|c| format!("{} {}", u16::from(c.code), c.reason.as_str())))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => ModelFrame::Closed(Some(e.to_string())),
            None => ModelFrame::Closed(None),
        };
        let closed = matches!(frame, ModelFrame::Closed(_));
        if tx.send(frame).await.is_err() || closed {
            return;
        }
    }
}
