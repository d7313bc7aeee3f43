//! Opus codec wrapper
//!
//! One encoder for the outgoing stream and one decoder per remote speaker.
//! Both operate on exactly one 60 ms canonical frame per packet.

pub mod decoder;
pub mod encoder;

use bytes::Bytes;

use crate::audio::buffer::AudioFrame;
use crate::error::CodecError;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;

/// Compresses canonical frames into packets
pub trait FrameEncoder: Send {
    fn encode(&mut self, frame: &AudioFrame) -> Result<Bytes, CodecError>;
}

/// Expands packets back into canonical frames
pub trait FrameDecoder: Send {
    fn decode(&mut self, packet: &[u8]) -> Result<AudioFrame, CodecError>;
}

/// Builds a fresh decoder for each new speaker
pub type DecoderFactory =
    std::sync::Arc<dyn Fn() -> Result<Box<dyn FrameDecoder>, CodecError> + Send + Sync>;

/// Factory producing Opus decoders
pub fn opus_decoder_factory() -> DecoderFactory {
    std::sync::Arc::new(|| Ok(Box::new(OpusDecoder::new()?) as Box<dyn FrameDecoder>))
}
