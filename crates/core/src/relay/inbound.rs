//! Caller to model: telephony frames in, audio appends out.

use super::{Flow, Relay};
use crate::{
    audio::{decode_base64, AudioFrame},
    readiness::Admission,
    telephony::{MediaPayload, StreamStart, TelephonyEvent},
    CloseReason, RelayError,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

impl Relay {
    /// Handles one raw text frame from the telephony socket.
    pub fn on_telephony_message(&mut self, text: &str, now: Instant) -> Result<Flow, RelayError> {
        let event: TelephonyEvent =
            serde_json::from_str(text).map_err(|e| RelayError::malformed("telephony", e))?;
        self.on_telephony_event(event, now)
    }

    pub fn on_telephony_event(
        &mut self,
        event: TelephonyEvent,
        now: Instant,
    ) -> Result<Flow, RelayError> {
        match event {
            TelephonyEvent::Connected => {
                debug!("Telephony stream connected");
                Ok(Flow::Continue)
            }
            TelephonyEvent::Start { start } => {
                self.on_stream_start(start);
                Ok(Flow::Continue)
            }
            TelephonyEvent::Media { media } => self.on_caller_media(media, now),
            TelephonyEvent::Stop => {
                info!("Telephony stream stopped");
                Ok(Flow::Close(CloseReason::TelephonyStop))
            }
            TelephonyEvent::Other => Ok(Flow::Continue),
        }
    }

    fn on_stream_start(&mut self, start: StreamStart) {
        if let Some(format) = &start.media_format {
            match format.audio_encoding() {
                Some(encoding) if encoding == self.settings.encoding => {}
                found => warn!(
                    expected = %self.settings.encoding,
                    received = %format.encoding,
                    ?found,
                    "Telephony media format differs from configured format"
                ),
            }
        }
        info!(stream_sid = %start.stream_sid, call_sid = ?start.call_sid, "Telephony stream started");
        self.stream_sid = Some(start.stream_sid);
        self.call_sid = start.call_sid;
    }

    fn on_caller_media(&mut self, media: MediaPayload, now: Instant) -> Result<Flow, RelayError> {
        let payload =
            decode_base64(&media.payload).map_err(|e| RelayError::malformed("telephony", e))?;
        let seq = media.chunk_number().unwrap_or(self.next_seq);
        self.next_seq = seq.saturating_add(1);
        self.stats.frames_in += 1;

        let frame = AudioFrame::caller(payload, self.settings.encoding, seq);
        match self.buffer.enqueue(frame)? {
            Admission::Queued => {
                self.stats.frames_buffered += 1;
            }
            Admission::Duplicate => {
                self.stats.duplicate_frames += 1;
            }
            Admission::Bypassed(frame) => {
                self.forward_caller_frame(&frame);
                if self.is_voiced(&frame) {
                    let actions = self.turn.on_caller_audio(now);
                    self.apply_turn_actions(actions);
                }
            }
        }
        Ok(Flow::Continue)
    }
}
