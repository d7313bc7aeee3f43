//! Audio playback to the output device
//!
//! A [`PlaybackSink`] hands out one named [`PlaybackEndpoint`] per remote
//! speaker. [`CpalPlaybackSink`] keeps a small sample queue per endpoint
//! and sums all of them inside a single cpal output callback.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::find_output_device;
use crate::audio::format::{PcmBuffer, PcmFormat};
use crate::constants::FRAME_DURATION_MS;
use crate::error::AudioError;

/// Frames an endpoint may queue before the oldest audio is dropped
const MAX_QUEUED_FRAMES: u64 = 4;

/// One speaker's stream into the output mix
pub trait PlaybackEndpoint: Send {
    /// Queue one buffer in the sink's format
    fn submit(&mut self, buffer: PcmBuffer) -> Result<(), AudioError>;

    /// Audio submitted but not yet rendered
    fn queued(&self) -> Duration;
}

/// Output that can mix any number of named streams
pub trait PlaybackSink: Send + Sync {
    /// Format every endpoint expects
    fn format(&self) -> PcmFormat;

    fn open_endpoint(&self, name: &str) -> Result<Box<dyn PlaybackEndpoint>, AudioError>;

    /// Next asynchronous device error, if any
    fn check_errors(&self) -> Option<AudioError> {
        None
    }
}

type StreamQueues = Arc<Mutex<HashMap<String, VecDeque<f32>>>>;

/// Mixes per-speaker streams into the output device
pub struct CpalPlaybackSink {
    format: PcmFormat,
    queues: StreamQueues,
    running: Arc<AtomicBool>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    error_rx: Receiver<AudioError>,
}

impl CpalPlaybackSink {
    /// Open the named output device (system default for `None`) and start it
    pub fn new(device_name: Option<&str>) -> Result<Self, AudioError> {
        let device = find_output_device(device_name)?;
        let default_config = device.default_output_config()?;
        let config: StreamConfig = default_config.config();
        let device_format = default_config.sample_format();

        // Endpoints always queue f32 at the device rate and layout
        let format = PcmFormat::new(config.sample_rate.0, config.channels, SampleFormat::F32, true)?;

        tracing::info!(
            "Output device {}: {} Hz, {} ch, {:?}",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            config.sample_rate.0,
            config.channels,
            device_format
        );

        let queues: StreamQueues = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let device_name = device_name.map(str::to_string);
        let handle = {
            let queues = queues.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("audio-playback".to_string())
                .spawn(move || {
                    let stream = find_output_device(device_name.as_deref()).and_then(|device| {
                        build_stream(&device, &config, device_format, queues, error_tx)
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
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?
        };

        let sink = Self {
            format,
            queues,
            running,
            thread_handle: Mutex::new(Some(handle)),
            error_rx,
        };

        ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("playback thread exited".into())))?;

        tracing::info!("Playback started");
        Ok(sink)
    }

    /// Number of open speaker streams
    pub fn stream_count(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
            tracing::info!("Playback stopped");
        }
    }
}

impl PlaybackSink for CpalPlaybackSink {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn open_endpoint(&self, name: &str) -> Result<Box<dyn PlaybackEndpoint>, AudioError> {
        self.queues.lock().entry(name.to_string()).or_default();
        Ok(Box::new(CpalEndpoint {
            name: name.to_string(),
            format: self.format,
            queues: self.queues.clone(),
        }))
    }

    fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }
}

impl Drop for CpalPlaybackSink {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CpalEndpoint {
    name: String,
    format: PcmFormat,
    queues: StreamQueues,
}

impl CpalEndpoint {
    fn max_queued_samples(&self) -> usize {
        let per_frame =
            self.format.sample_rate() as u64 * FRAME_DURATION_MS / 1000 * self.format.channels() as u64;
        (per_frame * MAX_QUEUED_FRAMES) as usize
    }
}

impl PlaybackEndpoint for CpalEndpoint {
    fn submit(&mut self, buffer: PcmBuffer) -> Result<(), AudioError> {
        if *buffer.format() != self.format {
            return Err(AudioError::Conversion(format!(
                "endpoint expects {:?}, got {:?}",
                self.format,
                buffer.format()
            )));
        }
        buffer.validate()?;

        let limit = self.max_queued_samples();
        let mut queues = self.queues.lock();
        let queue = queues.entry(self.name.clone()).or_default();
        queue.extend(buffer.data().to_f32());
        if queue.len() > limit {
            let excess = queue.len() - limit;
            queue.drain(..excess);
        }
        Ok(())
    }

    fn queued(&self) -> Duration {
        let samples = self.queues.lock().get(&self.name).map_or(0, VecDeque::len);
        let frames = samples / self.format.channels() as usize;
        Duration::from_secs_f64(frames as f64 / f64::from(self.format.sample_rate()))
    }
}

impl Drop for CpalEndpoint {
    fn drop(&mut self) {
        self.queues.lock().remove(&self.name);
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    queues: StreamQueues,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError> {
    match sample_format {
        SampleFormat::I16 => build_mixer_stream::<i16>(device, config, queues, error_tx),
        SampleFormat::U16 => build_mixer_stream::<u16>(device, config, queues, error_tx),
        SampleFormat::I32 => build_mixer_stream::<i32>(device, config, queues, error_tx),
        SampleFormat::F32 => build_mixer_stream::<f32>(device, config, queues, error_tx),
        other => Err(AudioError::FormatCreation(format!(
            "unsupported output sample format {:?}",
            other
        ))),
    }
}

fn build_mixer_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    queues: StreamQueues,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let mut mix: Vec<f32> = Vec::new();
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            mix.clear();
            mix.resize(data.len(), 0.0);

            // Never wait on the lock from the audio thread
            if let Some(mut queues) = queues.try_lock() {
                mix_queues(queues.values_mut(), &mut mix);
            }

            for (dst, &sample) in data.iter_mut().zip(mix.iter()) {
                *dst = T::from_sample(sample);
            }
        },
        move |err| {
            tracing::error!("Playback stream error: {}", err);
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )?;
    Ok(stream)
}

/// Sum the head of every queue into `mix`, consuming what was used
fn mix_queues<'a>(queues: impl Iterator<Item = &'a mut VecDeque<f32>>, mix: &mut [f32]) {
    let mut has_audio = false;
    for queue in queues {
        let take = mix.len().min(queue.len());
        for (dst, sample) in mix.iter_mut().zip(queue.drain(..take)) {
            *dst += sample;
        }
        has_audio |= take > 0;
    }
    if has_audio {
        for sample in mix.iter_mut() {
            *sample = soft_clip(*sample).clamp(-1.0, 1.0);
        }
    }
}

/// tanh-based limiter so several loud speakers saturate smoothly
fn soft_clip(sample: f32) -> f32 {
    (sample * 0.7).tanh() / 0.7_f32.tanh()
}

/// Sink that records submitted audio instead of playing it
///
/// Handy for headless runs and tests. Recorded buffers count as queued
/// until taken with [`MemorySink::take`].
pub struct MemorySink {
    format: PcmFormat,
    streams: Arc<Mutex<HashMap<String, Vec<PcmBuffer>>>>,
}

impl MemorySink {
    pub fn new(format: PcmFormat) -> Self {
        Self {
            format,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Remove and return everything recorded for `name`
    pub fn take(&self, name: &str) -> Vec<PcmBuffer> {
        self.streams
            .lock()
            .get_mut(name)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Buffers recorded for `name` and not yet taken
    pub fn recorded(&self, name: &str) -> usize {
        self.streams.lock().get(name).map_or(0, Vec::len)
    }

    /// Names of every endpoint opened so far
    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl PlaybackSink for MemorySink {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn open_endpoint(&self, name: &str) -> Result<Box<dyn PlaybackEndpoint>, AudioError> {
        self.streams.lock().entry(name.to_string()).or_default();
        Ok(Box::new(MemoryEndpoint {
            name: name.to_string(),
            streams: self.streams.clone(),
        }))
    }
}

struct MemoryEndpoint {
    name: String,
    streams: Arc<Mutex<HashMap<String, Vec<PcmBuffer>>>>,
}

impl PlaybackEndpoint for MemoryEndpoint {
    fn submit(&mut self, buffer: PcmBuffer) -> Result<(), AudioError> {
        self.streams
            .lock()
            .entry(self.name.clone())
            .or_default()
            .push(buffer);
        Ok(())
    }

    fn queued(&self) -> Duration {
        self.streams
            .lock()
            .get(&self.name)
            .map_or(Duration::ZERO, |buffers| buffers.iter().map(PcmBuffer::duration).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::AudioFrame;

    #[test]
    fn test_soft_clip_is_monotonic_and_odd() {
        assert_eq!(soft_clip(0.0), 0.0);
        assert!((soft_clip(1.0) - 1.0).abs() < 1e-6);
        assert!(soft_clip(0.5) < soft_clip(0.9));
        assert!((soft_clip(-0.5) + soft_clip(0.5)).abs() < 1e-6);
    }

    #[test]
    fn test_loud_mix_stays_in_range() {
        let mut a: VecDeque<f32> = vec![0.9; 4].into();
        let mut b: VecDeque<f32> = vec![0.9; 4].into();
        let mut c: VecDeque<f32> = vec![-0.9; 4].into();
        let mut mix = vec![0.0; 4];
        mix_queues([&mut a, &mut b].into_iter(), &mut mix);
        assert!(mix.iter().all(|&s| s <= 1.0));

        let mut mix = vec![-1.5; 4];
        mix_queues(std::iter::once(&mut c), &mut mix);
        assert!(mix.iter().all(|&s| s >= -1.0));
    }

    #[test]
    fn test_mix_sums_and_consumes() {
        let mut a: VecDeque<f32> = vec![0.1; 4].into();
        let mut b: VecDeque<f32> = vec![0.2; 2].into();
        let mut mix = vec![0.0; 3];

        mix_queues([&mut a, &mut b].into_iter(), &mut mix);

        assert!(mix[0] > mix[2]);
        assert!(mix[2] > 0.0);
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
    }

    #[test]
    fn test_mix_of_empty_queues_is_silence() {
        let mut a: VecDeque<f32> = VecDeque::new();
        let mut mix = vec![0.0; 8];
        mix_queues(std::iter::once(&mut a), &mut mix);
        assert!(mix.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_memory_sink_records_per_stream() {
        let sink = MemorySink::new(PcmFormat::canonical());
        let mut alice = sink.open_endpoint("alice").unwrap();
        let _bob = sink.open_endpoint("bob").unwrap();

        alice.submit(PcmBuffer::from_frame(AudioFrame::silence())).unwrap();
        assert_eq!(alice.queued(), Duration::from_millis(60));
        assert_eq!(sink.recorded("alice"), 1);
        assert_eq!(sink.recorded("bob"), 0);
        assert_eq!(sink.stream_names(), vec!["alice", "bob"]);

        assert_eq!(sink.take("alice").len(), 1);
        assert_eq!(alice.queued(), Duration::ZERO);
    }

    #[test]
    #[ignore = "requires an output device"]
    fn test_cpal_sink_accepts_its_own_format() {
        let sink = CpalPlaybackSink::new(None).unwrap();
        let mut endpoint = sink.open_endpoint("tone").unwrap();
        let format = sink.format();
        let samples = vec![0.0f32; format.sample_rate() as usize / 10 * format.channels() as usize];
        endpoint
            .submit(PcmBuffer::new(format, crate::audio::format::SampleData::F32(samples)))
            .unwrap();
        assert_eq!(sink.stream_count(), 1);
        drop(endpoint);
        assert_eq!(sink.stream_count(), 0);
    }
}
