//! Per-call relay dispatcher.
//!
//! A `Relay` is the single writer for one call's state. Both sockets' frames
//! are fed into it one at a time (`on_telephony_message`,
//! `on_model_message`, `on_silence_elapsed`), and every wire frame it wants
//! sent is appended to an ordered outbox that the caller drains after each
//! step. Because nothing else mutates the turn state, a barge-in and an audio
//! delta can never interleave halfway.

mod inbound;
mod outbound;

use crate::{
    audio::{AudioEncoding, AudioFrame},
    readiness::ReadinessBuffer,
    realtime_api::{ClientEvent, SessionConfig},
    telephony::TelephonyCommand,
    turn::{TurnAction, TurnController, TurnDetection, TurnState},
    CloseReason,
};
use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info};

/// Per-call settings, derived from the service configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub encoding: AudioEncoding,
    pub detection: TurnDetection,
    /// RMS level (i16 scale) at which a caller frame counts as speech for
    /// local turn detection.
    pub speech_energy_threshold: f64,
    /// Maximum audio held while the model is not ready.
    pub readiness_cap: Duration,
    pub instructions: String,
    pub voice: String,
}

/// A frame the I/O layer must write, in outbox order.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Model(ClientEvent),
    Telephony(TelephonyCommand),
}

/// Whether the call continues after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close(CloseReason),
}

/// Counters reported when the call ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_in: u64,
    pub frames_buffered: u64,
    pub frames_forwarded: u64,
    pub duplicate_frames: u64,
    pub deltas_forwarded: u64,
    pub stale_deltas: u64,
    pub responses: u64,
    pub refused_responses: u64,
    pub barge_ins: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelPhase {
    /// Socket opening or waiting for `session.created`.
    Connecting,
    /// Handshake sent, waiting for `session.updated`.
    HandshakeSent,
    Ready,
}

#[derive(Debug)]
pub struct Relay {
    settings: RelaySettings,
    phase: ModelPhase,
    stream_sid: Option<String>,
    call_sid: Option<String>,
    next_seq: u64,
    buffer: ReadinessBuffer,
    turn: TurnController,
    outbox: VecDeque<Outbound>,
    stats: RelayStats,
}

impl Relay {
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            buffer: ReadinessBuffer::new(settings.readiness_cap),
            turn: TurnController::new(settings.detection),
            settings,
            phase: ModelPhase::Connecting,
            stream_sid: None,
            call_sid: None,
            next_seq: 0,
            outbox: VecDeque::new(),
            stats: RelayStats::default(),
        }
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    pub fn call_sid(&self) -> Option<&str> {
        self.call_sid.as_deref()
    }

    /// True once the handshake has gone out and caller audio flows directly.
    pub fn is_ready(&self) -> bool {
        self.phase != ModelPhase::Connecting
    }

    pub fn turn_state(&self) -> TurnState {
        self.turn.state()
    }

    pub fn silence_deadline(&self) -> Option<Instant> {
        self.turn.silence_deadline()
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Takes everything queued for sending, oldest first.
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        self.outbox.drain(..).collect()
    }

    /// The local silence timer fired.
    pub fn on_silence_elapsed(&mut self, now: Instant) -> Flow {
        let actions = self.turn.on_silence_elapsed(now);
        self.apply_turn_actions(actions);
        Flow::Continue
    }

    /// Disarms the timer, drops held audio and anything not yet sent.
    pub fn shutdown(&mut self) {
        self.turn.shutdown();
        let dropped = self.buffer.discard();
        if dropped > 0 {
            debug!(dropped, "Discarded buffered caller audio on teardown");
        }
        self.outbox.clear();
    }

    /// The model accepted the connection: send the handshake, then release
    /// everything buffered, in order, ahead of any later frame.
    fn on_model_ready(&mut self, now: Instant) {
        if self.phase != ModelPhase::Connecting {
            debug!("Ignoring repeated session.created");
            return;
        }
        let session = SessionConfig::new(
            self.settings.encoding,
            self.settings.detection,
            self.settings.instructions.clone(),
            self.settings.voice.clone(),
        );
        self.outbox
            .push_back(Outbound::Model(ClientEvent::SessionUpdate { session }));
        self.phase = ModelPhase::HandshakeSent;

        let drained = self.buffer.drain_in_order();
        let voiced = drained.iter().any(|f| self.is_voiced(f));
        info!(buffered = drained.len(), "Model ready, handshake sent");
        for frame in &drained {
            self.forward_caller_frame(frame);
        }
        if voiced {
            let actions = self.turn.on_caller_audio(now);
            self.apply_turn_actions(actions);
        }
    }

    fn forward_caller_frame(&mut self, frame: &AudioFrame) {
        self.stats.frames_forwarded += 1;
        self.outbox
            .push_back(Outbound::Model(ClientEvent::InputAudioBufferAppend {
                audio: frame.to_base64(),
            }));
    }

    fn is_voiced(&self, frame: &AudioFrame) -> bool {
        matches!(self.settings.detection, TurnDetection::LocalSilence { .. })
            && frame.rms() > self.settings.speech_energy_threshold
    }

    fn apply_turn_actions(&mut self, actions: Vec<TurnAction>) {
        for action in actions {
            let model_event = match action {
                TurnAction::CommitAudio => ClientEvent::InputAudioBufferCommit,
                TurnAction::CreateResponse { generation } => ClientEvent::response_create(generation),
                TurnAction::CancelResponse => ClientEvent::ResponseCancel,
                TurnAction::ClearPlayback => {
                    match self.stream_sid.as_deref() {
                        Some(sid) => self
                            .outbox
                            .push_back(Outbound::Telephony(TelephonyCommand::clear(sid))),
                        None => debug!("No stream yet, skipping clear"),
                    }
                    continue;
                }
            };
            if !self.is_ready() {
                debug!(event = model_event.kind(), "Model not ready, skipping");
                continue;
            }
            match model_event {
                ClientEvent::ResponseCreate { .. } => self.stats.responses += 1,
                ClientEvent::ResponseCancel => self.stats.barge_ins += 1,
                _ => {}
            }
            self.outbox.push_back(Outbound::Model(model_event));
        }
    }
}
