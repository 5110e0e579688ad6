//! Telephony media-stream envelopes.
//!
//! The provider speaks JSON text frames tagged by an `event` field. Only the
//! fields the relay acts on are modelled; everything else is ignored.

use crate::audio::AudioEncoding;
use serde::{Deserialize, Serialize};

/// Frames received from the telephony media stream.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyEvent {
    /// Protocol greeting sent once the socket is open.
    Connected,
    /// The call's media stream started; carries the stream identifier.
    Start { start: StreamStart },
    /// A chunk of caller audio.
    Media { media: MediaPayload },
    /// The call ended on the provider side.
    Stop,
    /// Marks, DTMF and anything newer than this code.
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u8>,
}

impl MediaFormat {
    /// Maps the provider's encoding name onto the relay's encoding tag.
    pub fn audio_encoding(&self) -> Option<AudioEncoding> {
        match self.encoding.as_str() {
            "audio/x-mulaw" | "audio/pcmu" => Some(AudioEncoding::Pcmu),
            "audio/x-l16" | "audio/pcm" => Some(AudioEncoding::Pcm16),
            _ => None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MediaPayload {
    /// Base64 audio.
    pub payload: String,
    /// Decimal chunk counter assigned by the provider.
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub track: Option<String>,
}

impl MediaPayload {
    pub fn chunk_number(&self) -> Option<u64> {
        self.chunk.as_deref().and_then(|c| c.parse().ok())
    }
}

/// Frames sent back to the telephony media stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyCommand {
    /// Assistant audio to play to the caller.
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    /// Drop any audio already queued for playback.
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutboundMedia {
    pub payload: String,
}

impl TelephonyCommand {
    pub fn media(stream_sid: &str, payload: String) -> Self {
        TelephonyCommand::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia { payload },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        TelephonyCommand::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_start_with_metadata() {
        let raw = json!({
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ1",
            "start": {
                "accountSid": "AC1",
                "streamSid": "MZ1",
                "callSid": "CA1",
                "tracks": ["inbound"],
                "mediaFormat": { "encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1 }
            }
        });
        let event: TelephonyEvent = serde_json::from_value(raw).unwrap();
        let TelephonyEvent::Start { start } = event else {
            panic!("expected start");
        };
        assert_eq!(start.stream_sid, "MZ1");
        assert_eq!(start.call_sid.as_deref(), Some("CA1"));
        let format = start.media_format.unwrap();
        assert_eq!(format.audio_encoding(), Some(AudioEncoding::Pcmu));
        assert_eq!(format.sample_rate, Some(8000));
    }

    #[test]
    fn test_parse_minimal_start() {
        let event: TelephonyEvent =
            serde_json::from_str(r#"{"event":"start","start":{"streamSid":"CA123"}}"#).unwrap();
        assert_eq!(
            event,
            TelephonyEvent::Start {
                start: StreamStart {
                    stream_sid: "CA123".into(),
                    call_sid: None,
                    media_format: None,
                }
            }
        );
    }

    #[test]
    fn test_parse_media_and_chunk() {
        let event: TelephonyEvent = serde_json::from_str(
            r#"{"event":"media","media":{"track":"inbound","chunk":"42","timestamp":"840","payload":"//8="}}"#,
        )
        .unwrap();
        let TelephonyEvent::Media { media } = event else {
            panic!("expected media");
        };
        assert_eq!(media.payload, "//8=");
        assert_eq!(media.chunk_number(), Some(42));
    }

    #[test]
    fn test_parse_control_events() {
        let stop: TelephonyEvent =
            serde_json::from_str(r#"{"event":"stop","stop":{"callSid":"CA1"}}"#).unwrap();
        assert_eq!(stop, TelephonyEvent::Stop);

        let connected: TelephonyEvent =
            serde_json::from_str(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#)
                .unwrap();
        assert_eq!(connected, TelephonyEvent::Connected);

        let mark: TelephonyEvent =
            serde_json::from_str(r#"{"event":"mark","mark":{"name":"m1"}}"#).unwrap();
        assert_eq!(mark, TelephonyEvent::Other);
    }

    #[test]
    fn test_media_without_payload_is_rejected() {
        let result = serde_json::from_str::<TelephonyEvent>(r#"{"event":"media","media":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_outbound_commands() {
        let media = serde_json::to_value(TelephonyCommand::media("CA123", "AAE=".into())).unwrap();
        assert_eq!(
            media,
            json!({ "event": "media", "streamSid": "CA123", "media": { "payload": "AAE=" } })
        );

        let clear = serde_json::to_value(TelephonyCommand::clear("CA123")).unwrap();
        assert_eq!(clear, json!({ "event": "clear", "streamSid": "CA123" }));
    }
}
