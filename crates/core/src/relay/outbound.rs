//! Model to caller: model events in, playback and turn control out.

use super::{Flow, ModelPhase, Relay};
use crate::{
    realtime_api::{ErrorDetail, ServerEvent, create_generation},
    telephony::TelephonyCommand,
    turn::DeltaVerdict,
    RelayError,
};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Returned when a `response.create` arrives while a response is running.
const ACTIVE_RESPONSE_CODE: &str = "conversation_already_has_active_response";

impl Relay {
    /// Handles one raw text frame from the model socket.
    pub fn on_model_message(&mut self, text: &str, now: Instant) -> Result<Flow, RelayError> {
        let event: ServerEvent =
            serde_json::from_str(text).map_err(|e| RelayError::malformed("model", e))?;
        self.on_model_event(event, now)
    }

    pub fn on_model_event(&mut self, event: ServerEvent, now: Instant) -> Result<Flow, RelayError> {
        match event {
            ServerEvent::SessionCreated => self.on_model_ready(now),
            ServerEvent::SessionUpdated => {
                if self.phase == ModelPhase::HandshakeSent {
                    info!("Model accepted session configuration");
                    self.phase = ModelPhase::Ready;
                }
            }
            ServerEvent::SpeechStarted | ServerEvent::SpeechStopped if !self.is_ready() => {
                debug!("Ignoring speech signal before the handshake");
            }
            ServerEvent::SpeechStarted => {
                let actions = self.turn.on_explicit_speech_started();
                self.apply_turn_actions(actions);
            }
            ServerEvent::SpeechStopped => {
                let actions = self.turn.on_explicit_speech_stopped();
                self.apply_turn_actions(actions);
            }
            ServerEvent::ResponseCreated { response } => {
                self.turn.on_response_started(response.id.as_deref());
            }
            ServerEvent::ResponseAudioDelta { response_id, delta } => {
                self.on_audio_delta(response_id.as_deref(), delta);
            }
            ServerEvent::ResponseDone { response } => {
                if self.turn.on_response_completed(response.id.as_deref()) {
                    debug!(response_id = ?response.id, status = ?response.status, "Response complete");
                }
            }
            ServerEvent::Error { error } => return self.on_model_error(error),
            ServerEvent::Other => {}
        }
        Ok(Flow::Continue)
    }

    fn on_audio_delta(&mut self, response_id: Option<&str>, delta: String) {
        if self.turn.accept_delta(response_id) == DeltaVerdict::Stale {
            self.stats.stale_deltas += 1;
            trace!(?response_id, "Discarding stale audio delta");
            return;
        }
        match self.stream_sid.as_deref() {
            Some(sid) => {
                self.stats.deltas_forwarded += 1;
                self.outbox
                    .push_back(super::Outbound::Telephony(TelephonyCommand::media(sid, delta)));
            }
            None => debug!("No stream yet, dropping audio delta"),
        }
    }

    /// Errors while the handshake is unacknowledged mean the model rejected
    /// the session. Later errors are logged and the call carries on; a
    /// refused `response.create` also ends the turn that asked for it.
    fn on_model_error(&mut self, error: ErrorDetail) -> Result<Flow, RelayError> {
        if self.phase == ModelPhase::HandshakeSent {
            return Err(RelayError::UpstreamConfig(error.message));
        }
        warn!(
            kind = ?error.kind,
            code = ?error.code,
            event_id = ?error.event_id,
            message = %error.message,
            "Model reported an error"
        );
        let refused = match error.event_id.as_deref() {
            Some(event_id) => create_generation(event_id).map(Some),
            None if error.code.as_deref() == Some(ACTIVE_RESPONSE_CODE) => Some(None),
            None => None,
        };
        if let Some(generation) = refused {
            self.stats.refused_responses += 1;
            self.turn.on_response_rejected(generation);
        }
        Ok(Flow::Continue)
    }
}
