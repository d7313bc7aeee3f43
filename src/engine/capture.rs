//! Send path: device PCM in, encoded packets out
//!
//! [`CaptureEngine::process`] handles one hardware delivery: convert to the
//! canonical format, chunk into 60 ms frames, encode each frame and send it
//! at once. Nothing is buffered beyond the chunker remainder.
//!
//! [`CaptureWorker`] runs the engine on its own thread. The capture
//! callback only writes into a lossy ring and unparks the worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::create_shared_buffer;
use crate::audio::capture::CaptureHandoff;
use crate::audio::chunker::FrameChunker;
use crate::audio::format::{FormatConverter, PcmBuffer, PcmFormat};
use crate::codec::FrameEncoder;
use crate::error::{AudioError, NetworkError};
use crate::network::Transport;

/// Upper bound on how long the worker sleeps without being unparked
const WORKER_PARK_TIMEOUT: Duration = Duration::from_millis(20);

/// Snapshot of send-path counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub deliveries: u64,
    pub conversion_failures: u64,
    pub frames_encoded: u64,
    pub encode_failures: u64,
    pub packets_sent: u64,
    /// Encoded while the transport was down and thrown away
    pub packets_discarded: u64,
    pub send_errors: u64,
    /// Deliveries evicted from the hand-off ring before the worker got to them
    pub deliveries_dropped: u64,
}

#[derive(Default)]
struct CaptureCounters {
    deliveries: AtomicU64,
    conversion_failures: AtomicU64,
    frames_encoded: AtomicU64,
    encode_failures: AtomicU64,
    packets_sent: AtomicU64,
    packets_discarded: AtomicU64,
    send_errors: AtomicU64,
}

impl CaptureCounters {
    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            deliveries: self.deliveries.load(Ordering::Relaxed),
            conversion_failures: self.conversion_failures.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_discarded: self.packets_discarded.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            deliveries_dropped: 0,
        }
    }
}

/// Converts, chunks, encodes and sends captured audio
pub struct CaptureEngine {
    device_format: PcmFormat,
    /// `None` when the device already produces canonical PCM
    converter: Option<FormatConverter>,
    chunker: FrameChunker,
    encoder: Box<dyn FrameEncoder>,
    transport: Arc<dyn Transport>,
    counters: Arc<CaptureCounters>,
}

impl CaptureEngine {
    pub fn new(
        device_format: PcmFormat,
        encoder: Box<dyn FrameEncoder>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, AudioError> {
        let converter = if FormatConverter::needs_conversion(&device_format, &PcmFormat::canonical()) {
            Some(FormatConverter::to_canonical(device_format)?)
        } else {
            None
        };

        tracing::debug!(
            "Capture engine for {:?} (conversion {})",
            device_format,
            if converter.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            device_format,
            converter,
            chunker: FrameChunker::new(),
            encoder,
            transport,
            counters: Arc::new(CaptureCounters::default()),
        })
    }

    pub fn device_format(&self) -> &PcmFormat {
        &self.device_format
    }

    /// Handle one hardware delivery; returns the number of packets sent
    pub fn process(&mut self, buffer: &PcmBuffer) -> usize {
        self.counters.deliveries.fetch_add(1, Ordering::Relaxed);

        let converted;
        let canonical = match self.converter.as_mut() {
            Some(converter) => match converter.convert(buffer) {
                Ok(out) => {
                    converted = out;
                    &converted
                }
                Err(e) => {
                    self.counters
                        .conversion_failures
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Dropping capture buffer: {}", e);
                    return 0;
                }
            },
            None => buffer,
        };

        let samples = match canonical.as_i16() {
            Some(samples) if canonical.format().is_canonical() => samples,
            _ => {
                self.counters
                    .conversion_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Dropping capture buffer in unexpected format {:?}",
                    canonical.format()
                );
                return 0;
            }
        };

        let mut sent = 0;
        for frame in self.chunker.push(samples) {
            let packet = match self.encoder.encode(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    self.counters.encode_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Dropping frame: {}", e);
                    continue;
                }
            };
            self.counters.frames_encoded.fetch_add(1, Ordering::Relaxed);

            if !self.transport.is_connected() {
                self.counters
                    .packets_discarded
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }

            match self.transport.send(packet) {
                Ok(()) => {
                    self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                    sent += 1;
                }
                Err(e @ NetworkError::PacketTooLarge(_)) => {
                    self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Dropping frame: {}", e);
                }
                Err(e) => {
                    self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Send failed: {}", e);
                }
            }
        }
        sent
    }

    /// Samples waiting for the next frame
    pub fn pending_samples(&self) -> usize {
        self.chunker.pending()
    }

    /// Drop the partial frame and resampler history
    pub fn reset(&mut self) {
        self.chunker.reset();
        if let Some(converter) = self.converter.as_mut() {
            if let Err(e) = converter.reset() {
                tracing::warn!("Resampler reset failed: {}", e);
            }
        }
    }

    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }
}

/// Runs a [`CaptureEngine`] on a dedicated thread
pub struct CaptureWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    handoff: CaptureHandoff,
    counters: Arc<CaptureCounters>,
}

impl CaptureWorker {
    /// Start the worker; feed it through [`CaptureWorker::handoff`]
    pub fn spawn(mut engine: CaptureEngine, ring_capacity: usize) -> Result<Self, AudioError> {
        let ring = create_shared_buffer::<PcmBuffer>(ring_capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::clone(&engine.counters);

        let handle = {
            let ring = Arc::clone(&ring);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("capture-worker".to_string())
                .spawn(move || {
                    tracing::debug!("Capture worker started");
                    while running.load(Ordering::Acquire) {
                        while let Some(buffer) = ring.try_read() {
                            engine.process(&buffer);
                        }
                        thread::park_timeout(WORKER_PARK_TIMEOUT);
                    }
                    engine.reset();
                    tracing::debug!("Capture worker stopped");
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?
        };

        let handoff = CaptureHandoff::new(ring, handle.thread().clone());

        Ok(Self {
            running,
            handle: Some(handle),
            handoff,
            counters,
        })
    }

    /// Handle for the capture callback
    pub fn handoff(&self) -> CaptureHandoff {
        self.handoff.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            deliveries_dropped: self.handoff.dropped() as u64,
            ..self.counters.snapshot()
        }
    }

    /// Stop after the buffer currently being processed
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
