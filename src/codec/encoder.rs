//! Opus encoder wrapper
//!
//! Voice-tuned encoding of 60 ms mono frames.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::audio::buffer::AudioFrame;
use crate::codec::FrameEncoder;
use crate::config::CodecConfig;
use crate::constants::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::CodecError;

/// Opus encoder wrapper with voice settings
pub struct OpusEncoder {
    encoder: Encoder,
    config: CodecConfig,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
    failures: u64,
}

impl OpusEncoder {
    /// Create a new Opus encoder with the specified configuration
    pub fn new(config: CodecConfig) -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, &config)?;

        let encode_buffer = vec![0u8; config.max_packet_size];

        Ok(Self {
            encoder,
            config,
            encode_buffer,
            frames_encoded: 0,
            bytes_produced: 0,
            failures: 0,
        })
    }

    fn configure_encoder(encoder: &mut Encoder, config: &CodecConfig) -> Result<(), CodecError> {
        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        if config.vbr && config.cvbr {
            encoder
                .set_vbr_constraint(true)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set CVBR: {}", e)))?;
        }

        // No loss concealment downstream, so in-band FEC would be dead weight
        encoder
            .set_inband_fec(false)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        encoder
            .set_packet_loss_perc(config.packet_loss_perc as i32)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;

        Ok(())
    }

    /// Encode one canonical frame
    pub fn encode(&mut self, frame: &AudioFrame) -> Result<Bytes, CodecError> {
        if frame.frame_count() != FRAME_SAMPLES {
            self.failures += 1;
            return Err(CodecError::InvalidFrameSize(frame.frame_count()));
        }

        let size = match self.encoder.encode(frame.samples(), &mut self.encode_buffer) {
            Ok(size) => size,
            Err(e) => {
                self.failures += 1;
                return Err(CodecError::EncodingFailed(e.to_string()));
            }
        };

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    /// Update bitrate dynamically
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CodecError> {
        self.encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        self.config.bitrate = bitrate;
        Ok(())
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            failures: self.failures,
            average_packet_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

impl FrameEncoder for OpusEncoder {
    fn encode(&mut self, frame: &AudioFrame) -> Result<Bytes, CodecError> {
        OpusEncoder::encode(self, frame)
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub failures: u64,
    pub average_packet_size: f32,
}
