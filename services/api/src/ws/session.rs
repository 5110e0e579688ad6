//! Call session lifecycle and the per-call event loop.
//!
//! One task per call owns the [`Relay`] and is the only place its state is
//! touched. Telephony frames, model frames, model connection completion and
//! the silence timer are all selected in that task and handled one at a time.

use super::provider::{ModelFrame, ModelLink, RealtimeConnector};
use crate::registry::SessionRegistry;
use callbridge_core::{
    CloseReason, Flow, Outbound, Relay, RelayError, RelaySettings, RelayStats,
    telephony::TelephonyCommand,
};
use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, AtomicU8, Ordering},
};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A frame read from the telephony socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TelephonyFrame {
    Text(String),
    Closed(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Connecting,
            1 => Lifecycle::Active,
            2 => Lifecycle::Closing,
            _ => Lifecycle::Closed,
        }
    }
}

/// Shared handle to a call: lifecycle, cancellation and the one-shot
/// teardown guard. Held by the registry and by the call's own tasks.
pub struct SessionControl {
    session_id: Uuid,
    stream_sid: OnceLock<String>,
    lifecycle: AtomicU8,
    closed: AtomicBool,
    cancel: CancellationToken,
    registry: Arc<SessionRegistry>,
    started_at: Instant,
}

impl SessionControl {
    pub fn new(registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            session_id: Uuid::new_v4(),
            stream_sid: OnceLock::new(),
            lifecycle: AtomicU8::new(Lifecycle::Connecting as u8),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            registry,
            started_at: Instant::now(),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.get().map(String::as_str)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Records the stream identifier and registers the session under it.
    /// Later calls are ignored.
    pub fn register(self: &Arc<Self>, stream_sid: &str) {
        if self.stream_sid.set(stream_sid.to_string()).is_ok() {
            self.registry.insert(stream_sid, self.clone());
        }
    }

    /// Connecting -> Active, once the model handshake went out.
    pub fn activate(&self) -> bool {
        self.lifecycle
            .compare_exchange(
                Lifecycle::Connecting as u8,
                Lifecycle::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Tears the call down. Safe to call from any task, any number of times;
    /// only the first call has an effect and returns `true`.
    pub fn close(&self, reason: CloseReason, stats: Option<RelayStats>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.lifecycle
            .store(Lifecycle::Closing as u8, Ordering::Release);
        self.cancel.cancel();
        if let Some(sid) = self.stream_sid() {
            self.registry.remove(sid, self.session_id);
        }
        self.lifecycle.store(Lifecycle::Closed as u8, Ordering::Release);
        info!(
            session_id = %self.session_id,
            stream_sid = ?self.stream_sid(),
            %reason,
            duration_ms = self.started_at.elapsed().as_millis() as u64,
            ?stats,
            "Call session closed"
        );
        true
    }
}

/// What woke the event loop.
enum Input {
    Cancelled,
    ModelConnected(anyhow::Result<ModelLink>),
    Telephony(Option<TelephonyFrame>),
    Model(Option<ModelFrame>),
    SilenceElapsed,
}

/// Drives one call from telephony connect to teardown.
pub struct CallSession {
    control: Arc<SessionControl>,
    relay: Relay,
    connector: Arc<dyn RealtimeConnector>,
    model: Option<ModelLink>,
}

impl CallSession {
    pub fn new(
        control: Arc<SessionControl>,
        settings: RelaySettings,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Self {
        Self {
            control,
            relay: Relay::new(settings),
            connector,
            model: None,
        }
    }

    /// Runs until either side closes. `telephony_tx` is dropped on return,
    /// which ends the telephony writer.
    pub async fn run(
        mut self,
        mut telephony_rx: mpsc::Receiver<TelephonyFrame>,
        telephony_tx: mpsc::UnboundedSender<TelephonyCommand>,
    ) -> CloseReason {
        let cancel = self.control.cancel_token().clone();
        let connector = self.connector.clone();
        let mut connect = connector.connect(cancel.clone());
        let mut connecting = true;

        let reason = loop {
            let deadline = self.relay.silence_deadline();
            let input = tokio::select! {
                _ = cancel.cancelled() => Input::Cancelled,
                result = &mut connect, if connecting => Input::ModelConnected(result),
                frame = telephony_rx.recv() => Input::Telephony(frame),
                frame = next_model_frame(&mut self.model) => Input::Model(frame),
                _ = silence(deadline) => Input::SilenceElapsed,
            };

            let step = match input {
                Input::Cancelled => break CloseReason::Shutdown,
                Input::ModelConnected(result) => {
                    connecting = false;
                    self.on_model_connected(result)
                }
                Input::Telephony(frame) => self.on_telephony_frame(frame),
                Input::Model(frame) => self.on_model_frame(frame),
                Input::SilenceElapsed => Ok(self.relay.on_silence_elapsed(Instant::now())),
            };

            let flow = match step {
                Ok(flow) => flow,
                Err(e) => match e.close_reason() {
                    Some(reason) => {
                        error!(error = %e, "Ending call");
                        Flow::Close(reason)
                    }
                    None => {
                        warn!(error = %e, "Dropping message");
                        Flow::Continue
                    }
                },
            };

            self.flush(&telephony_tx);
            if let Flow::Close(reason) = flow {
                break reason;
            }
        };

        self.relay.shutdown();
        let stats = self.relay.stats();
        if !self.control.close(reason, Some(stats)) {
            debug!(?stats, "Call already closed elsewhere");
        }
        reason
    }

    fn on_model_connected(&mut self, result: anyhow::Result<ModelLink>) -> Result<Flow, RelayError> {
        match result {
            Ok(link) => {
                info!("Model connection open, awaiting session.created");
                self.model = Some(link);
                Ok(Flow::Continue)
            }
            Err(e) => {
                error!(error = ?e, "Could not open model connection");
                Ok(Flow::Close(CloseReason::ModelUnavailable))
            }
        }
    }

    fn on_telephony_frame(&mut self, frame: Option<TelephonyFrame>) -> Result<Flow, RelayError> {
        let text = match frame {
            Some(TelephonyFrame::Text(text)) => text,
            Some(TelephonyFrame::Closed(reason)) => {
                info!(?reason, "Telephony connection closed");
                return Ok(Flow::Close(CloseReason::TelephonyClosed));
            }
            None => return Ok(Flow::Close(CloseReason::TelephonyClosed)),
        };
        let flow = self.relay.on_telephony_message(&text, Instant::now());
        if self.control.stream_sid().is_none() {
            if let Some(sid) = self.relay.stream_sid() {
                tracing::Span::current().record("stream_sid", sid);
                self.control.register(sid);
            }
        }
        flow
    }

    fn on_model_frame(&mut self, frame: Option<ModelFrame>) -> Result<Flow, RelayError> {
        let text = match frame {
            Some(ModelFrame::Text(text)) => text,
            Some(ModelFrame::Closed(reason)) => {
                error!(?reason, "Model connection closed mid-call");
                return Ok(Flow::Close(CloseReason::ModelClosed));
            }
            None => return Ok(Flow::Close(CloseReason::ModelClosed)),
        };
        let flow = self.relay.on_model_message(&text, Instant::now());
        if self.relay.is_ready() && self.control.activate() {
            info!("Call session active");
        }
        flow
    }

    /// Writes the relay's outbox. Sends on a connection that is gone are
    /// dropped silently.
    fn flush(&mut self, telephony_tx: &mpsc::UnboundedSender<TelephonyCommand>) {
        for out in self.relay.take_outbox() {
            match out {
                Outbound::Model(event) => match &self.model {
                    Some(link) => {
                        if link.outgoing.send(event).is_err() {
                            debug!("Model writer gone, dropping event");
                        }
                    }
                    None => debug!(kind = event.kind(), "No model connection, dropping event"),
                },
                Outbound::Telephony(command) => {
                    if telephony_tx.send(command).is_err() {
                        debug!("Telephony writer gone, dropping command");
                    }
                }
            }
        }
    }
}

async fn next_model_frame(model: &mut Option<ModelLink>) -> Option<ModelFrame> {
    match model {
        Some(link) => link.incoming.recv().await,
        None => std::future::pending().await,
    }
}

async fn silence(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::provider::MockRealtimeConnector;
    use callbridge_core::{
        audio::{AudioEncoding, encode_base64},
        realtime_api::ClientEvent,
        turn::TurnDetection,
    };
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::{sync::mpsc::error::TryRecvError, task::JoinHandle};

    /// The telephony side of a running call.
    struct Call {
        control: Arc<SessionControl>,
        registry: Arc<SessionRegistry>,
        input: mpsc::Sender<TelephonyFrame>,
        output: mpsc::UnboundedReceiver<TelephonyCommand>,
        done: JoinHandle<CloseReason>,
    }

    impl Call {
        async fn send(&self, text: String) {
            self.input.send(TelephonyFrame::Text(text)).await.unwrap();
        }

        async fn start(&self, sid: &str) {
            self.send(json!({ "event": "start", "start": { "streamSid": sid } }).to_string())
                .await;
            while self.control.stream_sid().is_none() {
                tokio::task::yield_now().await;
            }
        }
    }

    /// The model side of a running call.
    struct Model {
        input: mpsc::Sender<ModelFrame>,
        output: mpsc::UnboundedReceiver<ClientEvent>,
    }

    impl Model {
        async fn send(&self, value: Value) {
            self.input
                .send(ModelFrame::Text(value.to_string()))
                .await
                .unwrap();
        }

        async fn next(&mut self) -> ClientEvent {
            self.output.recv().await.unwrap()
        }
    }

    fn settings(detection: TurnDetection) -> RelaySettings {
        RelaySettings {
            encoding: AudioEncoding::Pcmu,
            detection,
            speech_energy_threshold: 500.0,
            readiness_cap: Duration::from_secs(5),
            instructions: "Be kind.".into(),
            voice: "verse".into(),
        }
    }

    fn media(payload: &[u8]) -> String {
        json!({ "event": "media", "media": { "payload": encode_base64(payload) } }).to_string()
    }

    fn audio_append(payload: &[u8]) -> ClientEvent {
        ClientEvent::InputAudioBufferAppend {
            audio: encode_base64(payload),
        }
    }

    fn spawn_with(settings: RelaySettings, connector: MockRealtimeConnector) -> Call {
        let registry = Arc::new(SessionRegistry::new());
        let control = SessionControl::new(registry.clone());
        let (input, telephony_rx) = mpsc::channel(64);
        let (telephony_tx, output) = mpsc::unbounded_channel();
        let session = CallSession::new(control.clone(), settings, Arc::new(connector));
        let done = tokio::spawn(session.run(telephony_rx, telephony_tx));
        Call {
            control,
            registry,
            input,
            output,
            done,
        }
    }

    /// Starts a call whose model connection opens immediately.
    fn spawn_call(detection: TurnDetection) -> (Call, Model) {
        spawn_call_with(settings(detection))
    }

    fn spawn_call_with(settings: RelaySettings) -> (Call, Model) {
        let (outgoing, output) = mpsc::unbounded_channel();
        let (input, incoming) = mpsc::channel(64);
        let link = ModelLink { outgoing, incoming };
        let mut connector = MockRealtimeConnector::new();
        connector
            .expect_connect()
            .times(1)
            .return_once(move |_| Ok(link));
        (spawn_with(settings, connector), Model { input, output })
    }

    fn delta(response_id: &str, audio: &str) -> Value {
        json!({ "type": "response.output_audio.delta", "response_id": response_id, "delta": audio })
    }

    #[tokio::test]
    async fn test_call_end_to_end() {
        let (mut call, mut model) = spawn_call(TurnDetection::ServerVad);

        call.start("CA123").await;
        assert_eq!(call.registry.len(), 1);
        assert_eq!(call.control.lifecycle(), Lifecycle::Connecting);

        call.send(media(&[1, 2, 3])).await;
        model.send(json!({ "type": "session.created" })).await;
        assert!(matches!(model.next().await, ClientEvent::SessionUpdate { .. }));
        assert_eq!(call.control.lifecycle(), Lifecycle::Active);
        assert_eq!(model.next().await, audio_append(&[1, 2, 3]));

        model.send(json!({ "type": "input_audio_buffer.speech_started" })).await;
        model.send(json!({ "type": "input_audio_buffer.speech_stopped" })).await;
        assert_eq!(model.next().await, ClientEvent::InputAudioBufferCommit);
        assert_eq!(model.next().await, ClientEvent::response_create(1));

        model.send(delta("R1", "AAA=")).await;
        model.send(delta("R1", "AQE=")).await;
        assert_eq!(
            call.output.recv().await.unwrap(),
            TelephonyCommand::media("CA123", "AAA=".into())
        );
        assert_eq!(
            call.output.recv().await.unwrap(),
            TelephonyCommand::media("CA123", "AQE=".into())
        );

        // Barge-in: cancel upstream, flush playback downstream.
        model.send(json!({ "type": "input_audio_buffer.speech_started" })).await;
        assert_eq!(model.next().await, ClientEvent::ResponseCancel);
        assert_eq!(
            call.output.recv().await.unwrap(),
            TelephonyCommand::clear("CA123")
        );

        // A delta of the cancelled response arriving late is dropped. The
        // commit proves the loop has handled everything sent before it.
        model.send(delta("R1", "AgI=")).await;
        model.send(json!({ "type": "input_audio_buffer.speech_stopped" })).await;
        assert_eq!(model.next().await, ClientEvent::InputAudioBufferCommit);
        assert_eq!(call.output.try_recv(), Err(TryRecvError::Empty));

        call.send(json!({ "event": "stop" }).to_string()).await;
        assert_eq!(call.done.await.unwrap(), CloseReason::TelephonyStop);
        assert_eq!(call.control.lifecycle(), Lifecycle::Closed);
        assert!(call.registry.is_empty());
        assert!(call.control.cancel_token().is_cancelled());
        // The session dropped its sender; the telephony writer would end.
        let mut rest = Vec::new();
        while let Some(command) = call.output.recv().await {
            rest.push(command);
        }
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_ends_call() {
        let mut connector = MockRealtimeConnector::new();
        connector
            .expect_connect()
            .times(1)
            .return_once(|_| Err(anyhow::anyhow!("connection refused")));
        let call = spawn_with(settings(TurnDetection::ServerVad), connector);

        assert_eq!(call.done.await.unwrap(), CloseReason::ModelUnavailable);
        assert_eq!(call.control.lifecycle(), Lifecycle::Closed);
    }

    #[tokio::test]
    async fn test_model_close_ends_call() {
        let (call, model) = spawn_call(TurnDetection::ServerVad);
        call.start("CA1").await;
        model
            .input
            .send(ModelFrame::Closed(Some("1006".into())))
            .await
            .unwrap();
        assert_eq!(call.done.await.unwrap(), CloseReason::ModelClosed);
    }

    #[tokio::test]
    async fn test_handshake_error_ends_call() {
        let (call, mut model) = spawn_call(TurnDetection::ServerVad);
        model.send(json!({ "type": "session.created" })).await;
        assert!(matches!(model.next().await, ClientEvent::SessionUpdate { .. }));
        model
            .send(json!({
                "type": "error",
                "error": { "type": "invalid_request_error", "message": "Unknown voice" }
            }))
            .await;
        assert_eq!(call.done.await.unwrap(), CloseReason::HandshakeRejected);
    }

    #[tokio::test]
    async fn test_telephony_close_ends_call() {
        let (call, _model) = spawn_call(TurnDetection::ServerVad);
        call.start("CA1").await;
        call.input
            .send(TelephonyFrame::Closed(None))
            .await
            .unwrap();
        assert_eq!(call.done.await.unwrap(), CloseReason::TelephonyClosed);
        assert!(call.registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_ends_running_call() {
        let (call, _model) = spawn_call(TurnDetection::ServerVad);
        call.start("CA1").await;
        assert_eq!(call.registry.close_all(CloseReason::Shutdown), 1);
        assert_eq!(call.done.await.unwrap(), CloseReason::Shutdown);
        assert!(call.registry.is_empty());
    }

    #[tokio::test]
    async fn test_readiness_overflow_ends_call() {
        let (call, _model) = spawn_call_with(RelaySettings {
            readiness_cap: Duration::from_millis(40),
            ..settings(TurnDetection::ServerVad)
        });
        call.start("CA1").await;
        assert_eq!(call.registry.len(), 1);

        // The model never sends session.created; the third 20 ms frame
        // exceeds the cap.
        for _ in 0..3 {
            call.send(media(&[0xFF; 160])).await;
        }
        assert_eq!(call.done.await.unwrap(), CloseReason::BufferOverflow);
        assert!(call.registry.is_empty());
        assert!(call.control.cancel_token().is_cancelled());
        assert_eq!(call.control.lifecycle(), Lifecycle::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_silence_commits_after_last_voiced_frame() {
        let threshold = Duration::from_millis(1000);
        let (call, mut model) = spawn_call(TurnDetection::LocalSilence { threshold });

        model.send(json!({ "type": "session.created" })).await;
        assert!(matches!(model.next().await, ClientEvent::SessionUpdate { .. }));

        let t0 = Instant::now();
        let loud = [0x80u8; 160];
        call.send(media(&loud)).await;
        assert_eq!(model.next().await, audio_append(&loud));

        tokio::time::sleep(Duration::from_millis(300)).await;
        call.send(media(&loud)).await;
        assert_eq!(model.next().await, audio_append(&loud));

        assert_eq!(model.next().await, ClientEvent::InputAudioBufferCommit);
        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_millis(1300), "committed early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1350), "committed late: {elapsed:?}");
        assert_eq!(model.next().await, ClientEvent::response_create(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_close_runs_once() {
        let registry = Arc::new(SessionRegistry::new());
        let control = SessionControl::new(registry.clone());
        control.register("MZ9");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let control = control.clone();
                let reason = if i % 2 == 0 {
                    CloseReason::TelephonyClosed
                } else {
                    CloseReason::ModelClosed
                };
                tokio::spawn(async move { control.close(reason, None) })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(registry.is_empty());
        assert_eq!(control.lifecycle(), Lifecycle::Closed);
        assert!(!control.activate());
    }
}
