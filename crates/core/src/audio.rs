//! Audio frames and payload helpers.

use base64::Engine;
use std::{fmt, str::FromStr, time::Duration};

/// Sample rate of linear PCM audio exchanged with the realtime model.
pub const REALTIME_PCM16_SAMPLE_RATE: u64 = 24_000;
/// Sample rate of companded telephony audio.
pub const TELEPHONY_SAMPLE_RATE: u64 = 8_000;

/// Which party produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Caller,
    Assistant,
}

/// Encoding of a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioEncoding {
    /// G.711 mu-law, 8 kHz mono, one byte per sample.
    #[default]
    Pcmu,
    /// Little-endian 16-bit linear PCM, 24 kHz mono.
    Pcm16,
}

impl AudioEncoding {
    /// The format identifier used in the model session handshake.
    pub fn mime_type(self) -> &'static str {
        match self {
            AudioEncoding::Pcmu => "audio/pcmu",
            AudioEncoding::Pcm16 => "audio/pcm",
        }
    }

    fn bytes_per_second(self) -> u64 {
        match self {
            AudioEncoding::Pcmu => TELEPHONY_SAMPLE_RATE,
            AudioEncoding::Pcm16 => REALTIME_PCM16_SAMPLE_RATE * 2,
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown audio format '{0}', expected 'pcmu' or 'pcm16'")]
pub struct UnknownEncoding(pub String);

impl FromStr for AudioEncoding {
    type Err = UnknownEncoding;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pcmu" | "g711_ulaw" | "audio/pcmu" | "mulaw" => Ok(AudioEncoding::Pcmu),
            "pcm16" | "pcm" | "audio/pcm" => Ok(AudioEncoding::Pcm16),
            other => Err(UnknownEncoding(other.to_string())),
        }
    }
}

/// One chunk of audio travelling through the relay.
///
/// `seq` is scoped to the call. It is only used to spot duplicated or
/// regressed frames on the buffering path; frames are never reordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub payload: Vec<u8>,
    pub source: Source,
    pub encoding: AudioEncoding,
    pub seq: u64,
}

impl AudioFrame {
    pub fn caller(payload: Vec<u8>, encoding: AudioEncoding, seq: u64) -> Self {
        Self {
            payload,
            source: Source::Caller,
            encoding,
            seq,
        }
    }

    /// Playback duration of the payload.
    pub fn duration(&self) -> Duration {
        let micros = self.payload.len() as u64 * 1_000_000 / self.encoding.bytes_per_second();
        Duration::from_micros(micros)
    }

    pub fn to_base64(&self) -> String {
        encode_base64(&self.payload)
    }

    /// Root-mean-square energy of the frame on the i16 scale.
    pub fn rms(&self) -> f64 {
        match self.encoding {
            AudioEncoding::Pcmu => rms(self.payload.iter().map(|&b| mulaw_to_linear(b))),
            AudioEncoding::Pcm16 => rms(
                self.payload
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]])),
            ),
        }
    }
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(fragment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(fragment)
}

/// Expands one G.711 mu-law byte to a linear 16-bit sample.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let exponent = (u >> 4) & 0x07;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + 0x84) << exponent) - 0x84;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

fn rms(samples: impl Iterator<Item = i16>) -> f64 {
    let (sum, count) = samples.fold((0f64, 0usize), |(sum, n), s| {
        let v = s as f64;
        (sum + v * v, n + 1)
    });
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}
