//! Opus decoder wrapper
//!
//! Decodes one packet into one canonical frame. Missing or damaged
//! packets are reported as errors; the caller leaves a gap.

use opus::{Channels, Decoder};

use crate::audio::buffer::AudioFrame;
use crate::codec::FrameDecoder;
use crate::constants::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::CodecError;

/// Largest Opus packet duration (120 ms) so oversized packets are
/// detected instead of overrunning the buffer
const MAX_DECODE_SAMPLES: usize = SAMPLE_RATE as usize * 120 / 1000;

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    frames_decoded: u64,
    failures: u64,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, CodecError> {
        let decoder = Decoder::new(SAMPLE_RATE, Channels::Mono)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            decode_buffer: vec![0i16; MAX_DECODE_SAMPLES],
            frames_decoded: 0,
            failures: 0,
        })
    }

    /// Decode one packet into a 60 ms frame
    pub fn decode(&mut self, packet: &[u8]) -> Result<AudioFrame, CodecError> {
        // An empty packet asks Opus for concealment audio, which we never synthesize
        if packet.is_empty() {
            self.failures += 1;
            return Err(CodecError::EmptyPacket);
        }

        let samples = match self.decoder.decode(packet, &mut self.decode_buffer, false) {
            Ok(samples) => samples,
            Err(e) => {
                self.failures += 1;
                return Err(CodecError::DecodingFailed(e.to_string()));
            }
        };

        if samples != FRAME_SAMPLES {
            self.failures += 1;
            return Err(CodecError::InvalidFrameSize(samples));
        }

        self.frames_decoded += 1;
        AudioFrame::new(self.decode_buffer[..samples].to_vec())
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            failures: self.failures,
        }
    }
}

impl FrameDecoder for OpusDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<AudioFrame, CodecError> {
        OpusDecoder::decode(self, packet)
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub failures: u64,
}
