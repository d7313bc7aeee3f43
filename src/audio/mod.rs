//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod chunker;
pub mod device;
pub mod format;
pub mod playback;

pub use buffer::{AudioFrame, RingBuffer};
pub use capture::{CaptureHandoff, CaptureSource, CpalCapture};
pub use chunker::FrameChunker;
pub use device::{list_devices, DeviceInfo};
pub use format::{FormatConverter, PcmBuffer, PcmFormat, SampleData};
pub use playback::{CpalPlaybackSink, MemorySink, PlaybackEndpoint, PlaybackSink};
