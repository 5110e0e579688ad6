//! Telephony media-stream endpoint.

use super::session::{CallSession, SessionControl, TelephonyFrame};
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use callbridge_core::telephony::TelephonyCommand;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, field, info, warn};

/// Telephony frames the socket reader may queue ahead of the call loop.
const CHANNEL_BUFFER_SIZE: usize = 512;

/// Axum handler to upgrade the provider's media-stream request.
pub async fn media_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(|socket| handle_media_stream(socket, state))
}

/// Runs one call: socket pumps on either side of a [`CallSession`].
async fn handle_media_stream(socket: WebSocket, state: Arc<AppState>) {
    let control = SessionControl::new(state.registry.clone());
    let span = tracing::info_span!(
        "call",
        session_id = %control.session_id(),
        stream_sid = field::Empty
    );

    async move {
        info!("Telephony media stream connected");
        let cancel = control.cancel_token().clone();
        let (sink, stream) = socket.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

        let writer = tokio::spawn(write_commands(sink, out_rx, cancel.clone()).in_current_span());
        let reader = tokio::spawn(read_frames(stream, in_tx, cancel).in_current_span());

        let session = CallSession::new(
            control,
            state.config.relay_settings(),
            state.connector.clone(),
        );
        let reason = session.run(in_rx, out_tx).await;
        debug!(%reason, "Call loop finished");

        if let Err(e) = writer.await {
            error!(error = ?e, "Telephony writer task failed");
        }
        reader.abort();
    }
    .instrument(span)
    .await
}

async fn write_commands(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<TelephonyCommand>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            command = rx.recv() => {
                let Some(command) = command else { break };
                let text = match serde_json::to_string(&command) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "Failed to serialize telephony command");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "Failed to send to telephony socket");
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!(error = %e, "Telephony socket already closed");
    }
}

async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    tx: mpsc::Sender<TelephonyFrame>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = stream.next() => msg,
        };
        let frame = match msg {
            Some(Ok(Message::Text(text))) => TelephonyFrame::Text(text.to_string()),
            Some(Ok(Message::Close(close))) => {
                TelephonyFrame::Closed(close.map(|c| format!("{} {}", c.code, c.reason.as_str())))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => TelephonyFrame::Closed(Some(e.to_string())),
            None => TelephonyFrame::Closed(None),
        };
        let closed = matches!(frame, TelephonyFrame::Closed(_));
        if tx.send(frame).await.is_err() || closed {
            return;
        }
    }
}
