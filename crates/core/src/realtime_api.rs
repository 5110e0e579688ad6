//! Realtime speech-model envelopes.
//!
//! JSON text frames tagged by a `type` field. The relay only needs a small
//! slice of the protocol; unmodelled server events deserialize to
//! [`ServerEvent::Other`] and are ignored.

use crate::{audio::AudioEncoding, turn::TurnDetection};
use serde::{Deserialize, Serialize};

/// Events the relay sends to the model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// One-time session configuration handshake.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    /// `event_id` names the turn generation that asked for the response, so
    /// a rejection reported in an `error` event can be traced back to it.
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::ResponseCancel => "response.cancel",
        }
    }

    /// A `response.create` tagged with the requesting generation.
    pub fn response_create(generation: u64) -> Self {
        ClientEvent::ResponseCreate {
            event_id: Some(format!("{CREATE_EVENT_PREFIX}{generation}")),
        }
    }
}

const CREATE_EVENT_PREFIX: &str = "response-create-";

/// The generation a client `event_id` was issued for, if it tagged a
/// `response.create`.
pub fn create_generation(event_id: &str) -> Option<u64> {
    event_id.strip_prefix(CREATE_EVENT_PREFIX)?.parse().ok()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub audio: SessionAudio,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionAudio {
    pub input: AudioInput,
    pub output: AudioOutput,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AudioInput {
    pub format: AudioFormat,
    /// `null` switches provider-side voice activity detection off.
    pub turn_detection: Option<TurnDetectionConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AudioOutput {
    pub format: AudioFormat,
    pub voice: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AudioFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TurnDetectionConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// The relay issues commit and create itself, so the provider must not.
    pub create_response: bool,
    pub interrupt_response: bool,
}

impl SessionConfig {
    pub fn new(
        encoding: AudioEncoding,
        detection: TurnDetection,
        instructions: impl Into<String>,
        voice: impl Into<String>,
    ) -> Self {
        let format = AudioFormat {
            kind: encoding.mime_type().to_string(),
        };
        let turn_detection = match detection {
            TurnDetection::ServerVad => Some(TurnDetectionConfig {
                kind: "server_vad".to_string(),
                create_response: false,
                interrupt_response: false,
            }),
            TurnDetection::LocalSilence { .. } => None,
        };
        Self {
            modalities: vec!["audio".to_string()],
            instructions: instructions.into(),
            audio: SessionAudio {
                input: AudioInput {
                    format: format.clone(),
                    turn_detection,
                },
                output: AudioOutput {
                    format,
                    voice: voice.into(),
                },
            },
        }
    }
}

/// Events received from the model.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// The model accepted the connection and is ready for the handshake.
    #[serde(rename = "session.created")]
    SessionCreated,
    /// The handshake was applied.
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseRef,
    },
    #[serde(rename = "response.output_audio.delta", alias = "response.audio.delta")]
    ResponseAudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseRef,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorDetail,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ResponseRef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ErrorDetail {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    /// The client event that caused the error, when the model reports it.
    #[serde(default)]
    pub event_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_handshake_with_server_vad() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig::new(
                AudioEncoding::Pcmu,
                TurnDetection::ServerVad,
                "Be brief.",
                "verse",
            ),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "session.update",
                "session": {
                    "modalities": ["audio"],
                    "instructions": "Be brief.",
                    "audio": {
                        "input": {
                            "format": { "type": "audio/pcmu" },
                            "turn_detection": {
                                "type": "server_vad",
                                "create_response": false,
                                "interrupt_response": false
                            }
                        },
                        "output": {
                            "format": { "type": "audio/pcmu" },
                            "voice": "verse"
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn test_handshake_local_mode_disables_provider_vad() {
        let session = SessionConfig::new(
            AudioEncoding::Pcm16,
            TurnDetection::LocalSilence {
                threshold: Duration::from_millis(1000),
            },
            "",
            "alloy",
        );
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["audio"]["input"]["turn_detection"], json!(null));
        assert_eq!(value["audio"]["output"]["format"]["type"], "audio/pcm");
    }

    #[test]
    fn test_serialize_control_events() {
        let cases = [
            (ClientEvent::InputAudioBufferCommit, json!({"type": "input_audio_buffer.commit"})),
            (
                ClientEvent::ResponseCreate { event_id: None },
                json!({"type": "response.create"}),
            ),
            (
                ClientEvent::response_create(7),
                json!({"type": "response.create", "event_id": "response-create-7"}),
            ),
            (ClientEvent::ResponseCancel, json!({"type": "response.cancel"})),
            (
                ClientEvent::InputAudioBufferAppend { audio: "AA==".into() },
                json!({"type": "input_audio_buffer.append", "audio": "AA=="}),
            ),
        ];
        for (event, expected) in cases {
            assert_eq!(serde_json::to_value(&event).unwrap(), expected, "{}", event.kind());
        }
    }

    #[test]
    fn test_parse_server_events() {
        let created: ServerEvent =
            serde_json::from_str(r#"{"type":"session.created","session":{"id":"sess_1"}}"#).unwrap();
        assert_eq!(created, ServerEvent::SessionCreated);

        let started: ServerEvent = serde_json::from_str(
            r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":100,"item_id":"i1"}"#,
        )
        .unwrap();
        assert_eq!(started, ServerEvent::SpeechStarted);

        let done: ServerEvent = serde_json::from_str(
            r#"{"type":"response.done","response":{"id":"R1","status":"completed"}}"#,
        )
        .unwrap();
        assert_eq!(
            done,
            ServerEvent::ResponseDone {
                response: ResponseRef {
                    id: Some("R1".into()),
                    status: Some("completed".into()),
                }
            }
        );
    }

    #[test]
    fn test_parse_audio_delta_both_names() {
        for name in ["response.output_audio.delta", "response.audio.delta"] {
            let raw = json!({ "type": name, "response_id": "R1", "item_id": "i", "delta": "AAE=" });
            let event: ServerEvent = serde_json::from_value(raw).unwrap();
            assert_eq!(
                event,
                ServerEvent::ResponseAudioDelta {
                    response_id: Some("R1".into()),
                    delta: "AAE=".into(),
                }
            );
        }
    }

    #[test]
    fn test_create_generation() {
        assert_eq!(create_generation("response-create-12"), Some(12));
        assert_eq!(create_generation("response-create-x"), None);
        assert_eq!(create_generation("evt_123"), None);
    }

    #[test]
    fn test_parse_error_and_unknown() {
        let error: ServerEvent = serde_json::from_str(
            r#"{"type":"error","error":{"type":"invalid_request_error","code":"bad","message":"nope"}}"#,
        )
        .unwrap();
        let ServerEvent::Error { error } = error else {
            panic!("expected error");
        };
        assert_eq!(error.message, "nope");
        assert_eq!(error.code.as_deref(), Some("bad"));
        assert_eq!(error.event_id, None);

        let rejected: ServerEvent = serde_json::from_value(json!({
            "type": "error",
            "error": {
                "type": "invalid_request_error",
                "code": "conversation_already_has_active_response",
                "message": "busy",
                "event_id": "response-create-3"
            }
        }))
        .unwrap();
        let ServerEvent::Error { error } = rejected else {
            panic!("expected error");
        };
        assert_eq!(error.event_id.as_deref().and_then(create_generation), Some(3));

        let other: ServerEvent =
            serde_json::from_str(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert_eq!(other, ServerEvent::Other);
    }
}
