//! Send and receive pipelines
//!
//! Both engines are constructed explicitly by the session and own their
//! state; there are no globals.

pub mod capture;
pub mod playback;

pub use capture::{CaptureEngine, CaptureStats, CaptureWorker};
pub use playback::{ChannelState, ChannelStats, PlaybackChannel, PlaybackMixer, PlaybackTimer, TickReport};
