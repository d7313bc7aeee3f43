//! Fixed-duration framing
//!
//! Hardware delivers buffers of whatever size it likes; the codec only
//! accepts exactly [`FRAME_SAMPLES`] samples. The chunker keeps the
//! leftover between deliveries and emits whole frames in arrival order.

use crate::audio::buffer::AudioFrame;
use crate::constants::FRAME_SAMPLES;

/// Accumulates canonical samples into complete 60 ms frames
#[derive(Debug)]
pub struct FrameChunker {
    remainder: Vec<i16>,
    frames_emitted: u64,
}

impl FrameChunker {
    pub fn new() -> Self {
        Self {
            remainder: Vec::with_capacity(FRAME_SAMPLES * 2),
            frames_emitted: 0,
        }
    }

    /// Append a delivery and return every frame it completes
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.remainder.extend_from_slice(samples);

        let complete = self.remainder.len() / FRAME_SAMPLES;
        let mut frames = Vec::with_capacity(complete);
        for _ in 0..complete {
            let chunk: Vec<i16> = self.remainder.drain(..FRAME_SAMPLES).collect();
            frames.extend(AudioFrame::new(chunk).ok());
        }

        self.frames_emitted += frames.len() as u64;
        frames
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.remainder.len()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Discard the remainder without emitting it
    pub fn reset(&mut self) {
        self.remainder.clear();
    }
}

impl Default for FrameChunker {
    fn default() -> Self {
        Self::new()
    }
}
