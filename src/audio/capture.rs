//! Audio capture from the input device
//!
//! The cpal callback runs on a real-time thread and must never block. It
//! copies the delivery into a [`PcmBuffer`] in the device's native format,
//! writes it into the hand-off ring and unparks the capture worker. All
//! conversion and encoding happens on the worker.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crate::audio::buffer::SharedRingBuffer;
use crate::audio::device::find_input_device;
use crate::audio::format::{PcmBuffer, PcmFormat, SampleData};
use crate::error::AudioError;

/// Lossy, non-blocking path from the capture callback to the worker
#[derive(Clone)]
pub struct CaptureHandoff {
    ring: SharedRingBuffer<PcmBuffer>,
    worker: Thread,
}

impl CaptureHandoff {
    pub fn new(ring: SharedRingBuffer<PcmBuffer>, worker: Thread) -> Self {
        Self { ring, worker }
    }

    /// Queue a delivery and wake the worker; evicts the oldest if full
    pub fn deliver(&self, buffer: PcmBuffer) {
        self.ring.write(buffer);
        self.worker.unpark();
    }

    /// Deliveries evicted before the worker read them
    pub fn dropped(&self) -> usize {
        self.ring.overflow_count()
    }

    pub fn pending(&self) -> usize {
        self.ring.len()
    }
}

/// Anything that can produce device PCM into a hand-off
pub trait CaptureSource: Send {
    /// Native format of the buffers this source delivers
    fn format(&self) -> PcmFormat;

    fn start(&mut self, handoff: CaptureHandoff) -> Result<(), AudioError>;

    fn stop(&mut self);

    /// Next asynchronous device error, if any
    fn check_errors(&self) -> Option<AudioError> {
        None
    }
}

/// Sample types cpal may hand us that have a [`SampleData`] variant
trait CaptureSample: SizedSample + Send + 'static {
    fn collect(data: &[Self]) -> SampleData;
}

impl CaptureSample for i16 {
    fn collect(data: &[Self]) -> SampleData {
        SampleData::I16(data.to_vec())
    }
}

impl CaptureSample for u16 {
    fn collect(data: &[Self]) -> SampleData {
        SampleData::U16(data.to_vec())
    }
}

impl CaptureSample for i32 {
    fn collect(data: &[Self]) -> SampleData {
        SampleData::I32(data.to_vec())
    }
}

impl CaptureSample for f32 {
    fn collect(data: &[Self]) -> SampleData {
        SampleData::F32(data.to_vec())
    }
}

/// Microphone capture through cpal
pub struct CpalCapture {
    device_name: Option<String>,
    config: StreamConfig,
    format: PcmFormat,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
    deliveries: Arc<AtomicU64>,
}

impl CpalCapture {
    /// Open the named input device (system default for `None`)
    pub fn new(device_name: Option<&str>) -> Result<Self, AudioError> {
        let device = find_input_device(device_name)?;
        let default_config = device.default_input_config()?;

        let format = PcmFormat::new(
            default_config.sample_rate().0,
            default_config.channels(),
            default_config.sample_format(),
            true,
        )?;

        tracing::info!(
            "Input device {}: {} Hz, {} ch, {:?}",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            format.sample_rate(),
            format.channels(),
            format.sample_format()
        );

        Ok(Self {
            device_name: device_name.map(str::to_string),
            config: default_config.config(),
            format,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            deliveries: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Buffers delivered by the device so far
    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }
}

impl CaptureSource for CpalCapture {
    fn format(&self) -> PcmFormat {
        self.format
    }

    /// Build and play the stream on its own thread (cpal streams are not `Send`)
    fn start(&mut self, handoff: CaptureHandoff) -> Result<(), AudioError> {
        if self.is_running() {
            return Ok(());
        }

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let device_name = self.device_name.clone();
        let config = self.config.clone();
        let format = self.format;
        let running = self.running.clone();
        let deliveries = self.deliveries.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = find_input_device(device_name.as_deref()).and_then(|device| {
                    build_stream(&device, &config, format, handoff, deliveries, error_tx)
                });

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping capture
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("capture thread exited".into())));
        if let Err(e) = started {
            self.stop();
            return Err(e);
        }

        tracing::info!("Capture started");
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Capture stopped");
        }
    }

    fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: PcmFormat,
    handoff: CaptureHandoff,
    deliveries: Arc<AtomicU64>,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError> {
    match format.sample_format() {
        SampleFormat::I16 => {
            build_typed_stream::<i16>(device, config, format, handoff, deliveries, error_tx)
        }
        SampleFormat::U16 => {
            build_typed_stream::<u16>(device, config, format, handoff, deliveries, error_tx)
        }
        SampleFormat::I32 => {
            build_typed_stream::<i32>(device, config, format, handoff, deliveries, error_tx)
        }
        SampleFormat::F32 => {
            build_typed_stream::<f32>(device, config, format, handoff, deliveries, error_tx)
        }
        other => Err(AudioError::FormatCreation(format!(
            "unsupported input sample format {:?}",
            other
        ))),
    }
}

fn build_typed_stream<T: CaptureSample>(
    device: &cpal::Device,
    config: &StreamConfig,
    format: PcmFormat,
    handoff: CaptureHandoff,
    deliveries: Arc<AtomicU64>,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError> {
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            deliveries.fetch_add(1, Ordering::Relaxed);
            handoff.deliver(PcmBuffer::new(format, T::collect(data)));
        },
        move |err| {
            tracing::error!("Capture stream error: {}", err);
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )?;
    Ok(stream)
}
