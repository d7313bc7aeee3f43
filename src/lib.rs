//! # Voice Room
//!
//! Real-time multi-participant voice chat over an unreliable transport.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── SEND PATH ─────────────────────────────────┐
//! │                                                                            │
//! │  ┌────────────┐  raw PCM   ┌────────────┐  60ms frames  ┌────────────┐     │
//! │  │ Microphone │ ─────────▶ │ Capture    │ ────────────▶ │   Opus     │     │
//! │  │ (cpal cb)  │ RingBuffer │ Worker     │  convert +    │  Encoder   │     │
//! │  └────────────┘  + unpark  │            │  chunk        │            │     │
//! │                            └────────────┘               └─────┬──────┘     │
//! │                                                               │ packet     │
//! │                                                               ▼            │
//! │                                                      Transport::send       │
//! └────────────────────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────── RECEIVE PATH ───────────────────────────────┐
//! │                                                                            │
//! │  Transport receive ──(speaker, packet)──▶ PlaybackMixer::on_packet         │
//! │                                              │                             │
//! │            ┌─────────────────┬───────────────┴─┬─────────────────┐         │
//! │            ▼                 ▼                 ▼                 ▼         │
//! │     ┌────────────┐    ┌────────────┐    ┌────────────┐    ┌────────────┐   │
//! │     │ Speaker A  │    │ Speaker B  │    │ Speaker C  │    │    ...     │   │
//! │     │ decode +   │    │ decode +   │    │ decode +   │    │            │   │
//! │     │ resample   │    │ resample   │    │ resample   │    │            │   │
//! │     │ RingBuffer │    │ RingBuffer │    │ RingBuffer │    │            │   │
//! │     └─────┬──────┘    └─────┬──────┘    └─────┬──────┘    └────────────┘   │
//! │           │   one frame per channel every 60ms (PlaybackTimer)             │
//! │           ▼                 ▼                 ▼                            │
//! │     ┌──────────────────────────────────────────────────────────────┐       │
//! │     │          Playback sink: named streams mixed to one output    │       │
//! │     └──────────────────────────────────────────────────────────────┘       │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod network;
pub mod session;

pub use error::{Error, Result};
pub use network::SpeakerId;
pub use session::VoiceSession;

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Canonical sample rate for everything entering or leaving the codec
    pub const SAMPLE_RATE: u32 = 48_000;

    /// Canonical channel count (mono)
    pub const CHANNELS: u16 = 1;

    /// Frame duration in milliseconds
    pub const FRAME_DURATION_MS: u64 = 60;

    /// Samples per frame: 60 ms @ 48 kHz
    pub const FRAME_SAMPLES: usize = 2880;

    /// Playback scheduler period, equal to one frame
    pub const TICK_INTERVAL: Duration = Duration::from_millis(FRAME_DURATION_MS);

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 24_000;

    /// Upper bound on a single encoded packet
    ///
    /// Opus lowers the instant bitrate to fit, so with the envelope and the
    /// longest sender id every packet still fits one datagram.
    pub const MAX_PACKET_SIZE: usize = 1200;

    /// Default per-speaker jitter buffer capacity (in frames, ~1.9 s)
    pub const DEFAULT_JITTER_CAPACITY: usize = 32;

    /// Capture hand-off capacity (in hardware deliveries)
    pub const DEFAULT_CAPTURE_RING_CAPACITY: usize = 16;

    /// Default UDP port for voice traffic
    pub const DEFAULT_UDP_PORT: u16 = 5000;

    /// Maximum UDP datagram payload we will emit
    pub const MAX_DATAGRAM_SIZE: usize = 1472;
}
