//! Turn-taking controller.
//!
//! Decides when the caller's utterance is over (so the model should answer)
//! and when an answer in progress must be cut off because the caller started
//! talking again. Two detection strategies share one contract:
//!
//! - [`TurnDetection::ServerVad`]: the model reports speech start/stop.
//! - [`TurnDetection::LocalSilence`]: a silence timer, re-armed on every voiced
//!   caller frame, ends the turn when it runs out.
//!
//! The controller is driven from a single task per call, so every method here
//! runs to completion before the next event is looked at. Barge-in invalidates
//! the live response token before it hands back the cancel action, which is
//! what lets the outbound path drop deltas that were already on the wire.

use std::{
    collections::{HashSet, VecDeque},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// How the end of a caller turn is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDetection {
    ServerVad,
    LocalSilence { threshold: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    CallerSpeaking,
    PendingCommit,
    AssistantResponding,
}

impl TurnState {
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Idle, CallerSpeaking)
                | (CallerSpeaking, PendingCommit)
                | (PendingCommit, AssistantResponding)
                | (AssistantResponding, CallerSpeaking)
                | (_, Idle)
        )
    }
}

/// Side effects the controller asks for, in the order they must be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnAction {
    /// Model: commit buffered caller audio.
    CommitAudio,
    /// Model: start generating a response for this generation.
    CreateResponse { generation: u64 },
    /// Model: stop generating the current response.
    CancelResponse,
    /// Telephony: drop audio queued for playback.
    ClearPlayback,
}

/// Correlation token for the response currently being generated.
///
/// The generation number is assigned locally when the response is requested.
/// The provider's response id is learned later, from `response.created` or
/// the first delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResponse {
    generation: u64,
    response_id: Option<String>,
}

impl PendingResponse {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }
}

/// Whether an audio delta may be played to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaVerdict {
    Forward,
    Stale,
}

#[derive(Debug)]
pub struct TurnController {
    detection: TurnDetection,
    state: TurnState,
    pending: Option<PendingResponse>,
    next_generation: u64,
    /// Generations requested from the model that have no provider id yet,
    /// oldest first. The model creates responses in request order.
    awaiting_id: VecDeque<u64>,
    /// Provider ids of cancelled or unrequested responses whose
    /// `response.done` has not been seen yet.
    retired: HashSet<String>,
    silence_deadline: Option<Instant>,
}

impl TurnController {
    pub fn new(detection: TurnDetection) -> Self {
        Self {
            detection,
            state: TurnState::Idle,
            pending: None,
            next_generation: 1,
            awaiting_id: VecDeque::new(),
            retired: HashSet::new(),
            silence_deadline: None,
        }
    }

    pub fn detection(&self) -> TurnDetection {
        self.detection
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn pending(&self) -> Option<&PendingResponse> {
        self.pending.as_ref()
    }

    /// When the local silence timer fires, if armed.
    pub fn silence_deadline(&self) -> Option<Instant> {
        self.silence_deadline
    }

    /// Caller audio was observed. Only the local strategy reacts: the frame
    /// counts as speech, which may barge in, and the silence timer restarts.
    pub fn on_caller_audio(&mut self, now: Instant) -> Vec<TurnAction> {
        let TurnDetection::LocalSilence { threshold } = self.detection else {
            return Vec::new();
        };
        let actions = self.caller_started_speaking();
        self.silence_deadline = Some(now + threshold);
        actions
    }

    /// The model detected the start of caller speech.
    pub fn on_explicit_speech_started(&mut self) -> Vec<TurnAction> {
        self.caller_started_speaking()
    }

    /// The model detected the end of caller speech.
    pub fn on_explicit_speech_stopped(&mut self) -> Vec<TurnAction> {
        match self.state {
            TurnState::Idle | TurnState::CallerSpeaking => self.end_caller_turn(),
            TurnState::PendingCommit | TurnState::AssistantResponding => {
                debug!(state = ?self.state, "Ignoring speech stop outside a caller turn");
                Vec::new()
            }
        }
    }

    /// The silence timer ran out. Stale wakeups (the deadline moved on since
    /// the timer was scheduled) are ignored.
    pub fn on_silence_elapsed(&mut self, now: Instant) -> Vec<TurnAction> {
        match self.silence_deadline {
            Some(deadline) if now >= deadline => {
                self.silence_deadline = None;
                if self.state == TurnState::CallerSpeaking {
                    debug!("Caller silent past threshold, ending turn");
                    self.end_caller_turn()
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// The model announced a response. Binds the provider id to the
    /// generation that requested it, or retires it if that generation was
    /// already cancelled.
    pub fn on_response_started(&mut self, response_id: Option<&str>) {
        if let Some(id) = response_id {
            if self.is_known(id) {
                return;
            }
        }
        let Some(generation) = self.awaiting_id.pop_front() else {
            debug!(?response_id, "Response started that was not requested");
            if let Some(id) = response_id {
                self.retired.insert(id.to_string());
            }
            return;
        };
        let Some(id) = response_id else {
            return;
        };
        match self.pending.as_mut() {
            Some(pending) if pending.generation == generation => {
                trace!(generation, id, "Bound response id");
                pending.response_id = Some(id.to_string());
            }
            _ => {
                trace!(generation, id, "Response id belongs to a cancelled generation");
                self.retired.insert(id.to_string());
            }
        }
    }

    /// The model refused a `response.create`. `generation` is the requester
    /// when the error names it; otherwise the oldest request still waiting
    /// for an id is the one refused, since the model answers requests in
    /// order. Returns `true` when the live response was dropped and the turn
    /// is over.
    pub fn on_response_rejected(&mut self, generation: Option<u64>) -> bool {
        let Some(generation) = generation.or_else(|| self.awaiting_id.front().copied()) else {
            debug!("Rejected response matches no outstanding request");
            return false;
        };
        self.awaiting_id.retain(|g| *g != generation);
        let live = self
            .pending
            .as_ref()
            .is_some_and(|p| p.generation == generation && p.response_id.is_none());
        if !live {
            return false;
        }
        info!(generation, "Model refused the response, ending turn");
        self.pending = None;
        self.transition(TurnState::Idle);
        true
    }

    /// Decides whether an audio delta belongs to the live response.
    pub fn accept_delta(&mut self, response_id: Option<&str>) -> DeltaVerdict {
        if self.state != TurnState::AssistantResponding {
            return DeltaVerdict::Stale;
        }
        let Some(pending) = self.pending.as_mut() else {
            return DeltaVerdict::Stale;
        };
        let Some(id) = response_id else {
            return DeltaVerdict::Forward;
        };
        match pending.response_id.as_deref() {
            Some(bound) if bound == id => DeltaVerdict::Forward,
            Some(_) => DeltaVerdict::Stale,
            None => {
                // Learn the id from the first delta, but only when no older
                // cancelled generation could still own it.
                if self.retired.contains(id) || self.awaiting_id.front() != Some(&pending.generation)
                {
                    return DeltaVerdict::Stale;
                }
                self.awaiting_id.pop_front();
                pending.response_id = Some(id.to_string());
                DeltaVerdict::Forward
            }
        }
    }

    /// The model finished a response. Returns `true` when it was the live one
    /// and the turn is over. No event for a response follows its
    /// `response.done`, so its id is forgotten here.
    pub fn on_response_completed(&mut self, response_id: Option<&str>) -> bool {
        if let Some(id) = response_id {
            if self.retired.remove(id) {
                return false;
            }
        }
        let Some(pending) = self.pending.as_ref() else {
            return false;
        };
        if let (Some(id), Some(bound)) = (response_id, pending.response_id.as_deref()) {
            if bound != id {
                return false;
            }
        }
        if let Some(pending) = self.pending.take() {
            self.awaiting_id.retain(|g| *g != pending.generation);
        }
        self.transition(TurnState::Idle);
        true
    }

    /// Disarms the timer and forgets the live response. Used on teardown.
    pub fn shutdown(&mut self) {
        self.silence_deadline = None;
        self.pending = None;
        self.state = TurnState::Idle;
    }

    fn caller_started_speaking(&mut self) -> Vec<TurnAction> {
        match self.state {
            TurnState::Idle => {
                self.transition(TurnState::CallerSpeaking);
                Vec::new()
            }
            TurnState::AssistantResponding => self.barge_in(),
            TurnState::CallerSpeaking | TurnState::PendingCommit => Vec::new(),
        }
    }

    fn barge_in(&mut self) -> Vec<TurnAction> {
        // Invalidate first: any delta processed after this point is stale.
        if let Some(pending) = self.pending.take() {
            info!(
                generation = pending.generation,
                response_id = ?pending.response_id,
                "Caller barged in, cancelling response"
            );
            if let Some(id) = pending.response_id {
                self.retired.insert(id);
            }
        }
        self.transition(TurnState::CallerSpeaking);
        vec![TurnAction::CancelResponse, TurnAction::ClearPlayback]
    }

    fn end_caller_turn(&mut self) -> Vec<TurnAction> {
        if self.state == TurnState::Idle {
            self.transition(TurnState::CallerSpeaking);
        }
        self.silence_deadline = None;
        self.transition(TurnState::PendingCommit);

        let generation = self.next_generation;
        self.next_generation += 1;
        self.pending = Some(PendingResponse {
            generation,
            response_id: None,
        });
        self.awaiting_id.push_back(generation);
        self.transition(TurnState::AssistantResponding);
        debug!(generation, "Caller turn committed, requesting response");
        vec![TurnAction::CommitAudio, TurnAction::CreateResponse { generation }]
    }

    fn is_known(&self, id: &str) -> bool {
        self.retired.contains(id)
            || self
                .pending
                .as_ref()
                .is_some_and(|p| p.response_id.as_deref() == Some(id))
    }

    fn transition(&mut self, next: TurnState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal turn transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(from = ?self.state, to = ?next, "Turn transition");
        self.state = next;
    }
}
