//! Readiness latch for caller audio.
//!
//! Caller audio starts flowing before the model socket has finished its
//! handshake. Frames are held here in arrival order, released exactly once
//! when the model becomes ready, and from then on pass straight through.

use crate::{audio::AudioFrame, error::RelayError};
use std::{collections::VecDeque, time::Duration};
use tracing::debug;

/// Outcome of offering a frame to the buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Held until the latch is released.
    Queued,
    /// The latch is already released; forward the frame now.
    Bypassed(AudioFrame),
    /// The frame's sequence number did not advance; it was dropped.
    Duplicate,
}

#[derive(Debug)]
enum Latch {
    Buffering {
        frames: VecDeque<AudioFrame>,
        buffered: Duration,
    },
    Released,
}

#[derive(Debug)]
pub struct ReadinessBuffer {
    latch: Latch,
    cap: Duration,
    last_seq: Option<u64>,
}

impl ReadinessBuffer {
    /// `cap` bounds the audio duration that may be held before readiness.
    pub fn new(cap: Duration) -> Self {
        Self {
            latch: Latch::Buffering {
                frames: VecDeque::new(),
                buffered: Duration::ZERO,
            },
            cap,
            last_seq: None,
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(self.latch, Latch::Released)
    }

    /// Number of frames currently held.
    pub fn len(&self) -> usize {
        match &self.latch {
            Latch::Buffering { frames, .. } => frames.len(),
            Latch::Released => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Audio duration currently held.
    pub fn buffered(&self) -> Duration {
        match &self.latch {
            Latch::Buffering { buffered, .. } => *buffered,
            Latch::Released => Duration::ZERO,
        }
    }

    /// Offers a frame. Fails with `BufferOverflow` once the held audio
    /// would exceed the cap; the call is expected to end at that point.
    pub fn enqueue(&mut self, frame: AudioFrame) -> Result<Admission, RelayError> {
        if self.last_seq.is_some_and(|last| frame.seq <= last) {
            debug!(seq = frame.seq, last = ?self.last_seq, "Dropping duplicate caller frame");
            return Ok(Admission::Duplicate);
        }
        self.last_seq = Some(frame.seq);

        match &mut self.latch {
            Latch::Released => Ok(Admission::Bypassed(frame)),
            Latch::Buffering { frames, buffered } => {
                let next = *buffered + frame.duration();
                if next > self.cap {
                    return Err(RelayError::BufferOverflow {
                        buffered: next,
                        cap: self.cap,
                    });
                }
                *buffered = next;
                frames.push_back(frame);
                Ok(Admission::Queued)
            }
        }
    }

    /// Releases the latch and returns everything held, in enqueue order.
    /// Only the first call returns frames.
    pub fn drain_in_order(&mut self) -> Vec<AudioFrame> {
        match std::mem::replace(&mut self.latch, Latch::Released) {
            Latch::Buffering { frames, .. } => frames.into(),
            Latch::Released => Vec::new(),
        }
    }

    /// Drops held frames without forwarding them. Used on teardown.
    pub fn discard(&mut self) -> usize {
        let dropped = self.len();
        self.latch = Latch::Released;
        dropped
    }
}
