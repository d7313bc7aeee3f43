//! Voice session
//!
//! Ties one transport, one capture pipeline and one playback mixer
//! together. Built explicitly from configuration; nothing is global.
//! Sessions are one-shot: `stop` shuts the transport down, so a stopped
//! session cannot be started again. Build a new one instead.
//!
//! ```text
//! CaptureSource ──▶ CaptureWorker(CaptureEngine) ──▶ Transport::send
//! Transport receive ──▶ PlaybackMixer::on_packet ──▶ rings ──▶ PlaybackTimer ──▶ sink
//! ```

use std::sync::Arc;

use crate::audio::capture::CaptureSource;
use crate::audio::playback::PlaybackSink;
use crate::codec::{opus_decoder_factory, DecoderFactory, FrameEncoder, OpusEncoder};
use crate::config::AppConfig;
use crate::constants::TICK_INTERVAL;
use crate::engine::{CaptureEngine, CaptureStats, CaptureWorker, ChannelStats, PlaybackMixer, PlaybackTimer};
use crate::error::{AudioError, Error, Result};
use crate::network::{ReceiveHandler, SpeakerId, Transport};

/// Point-in-time view of a running session
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub capture: Option<CaptureStats>,
    pub channels: Vec<ChannelStats>,
    pub ticks: u64,
    pub connected: bool,
}

/// A participant in a voice room
pub struct VoiceSession {
    config: AppConfig,
    transport: Arc<dyn Transport>,
    mixer: Arc<PlaybackMixer>,
    capture: Option<Box<dyn CaptureSource>>,
    worker: Option<CaptureWorker>,
    timer: Option<PlaybackTimer>,
    closed: bool,
}

impl VoiceSession {
    /// Build a session with Opus decoding
    ///
    /// `connect` receives our identity and the handler incoming packets
    /// must be delivered to, and returns the transport to send through.
    pub fn new<F>(config: AppConfig, sink: Arc<dyn PlaybackSink>, connect: F) -> Result<Self>
    where
        F: FnOnce(SpeakerId, ReceiveHandler) -> Result<Arc<dyn Transport>>,
    {
        Self::with_decoders(config, sink, opus_decoder_factory(), connect)
    }

    /// Build a session with a custom decoder factory
    pub fn with_decoders<F>(
        config: AppConfig,
        sink: Arc<dyn PlaybackSink>,
        decoder_factory: DecoderFactory,
        connect: F,
    ) -> Result<Self>
    where
        F: FnOnce(SpeakerId, ReceiveHandler) -> Result<Arc<dyn Transport>>,
    {
        config.validate()?;

        let mixer = Arc::new(PlaybackMixer::new(
            sink,
            decoder_factory,
            config.playback.jitter_capacity,
        ));
        let local_id = SpeakerId::new(config.identity.name.clone());
        let transport = connect(local_id, mixer.receive_handler())?;
        mixer.attach_transport(Arc::clone(&transport));

        tracing::info!(
            "Session ready as {} (jitter buffer {} frames)",
            transport.local_id(),
            config.playback.jitter_capacity
        );

        Ok(Self {
            config,
            transport,
            mixer,
            capture: None,
            worker: None,
            timer: None,
            closed: false,
        })
    }

    /// Start playback and, if given, capture with an Opus encoder
    pub fn start(&mut self, capture: Option<Box<dyn CaptureSource>>) -> Result<()> {
        let encoder = match capture {
            Some(_) => Some(Box::new(OpusEncoder::new(self.config.codec.clone())?) as Box<dyn FrameEncoder>),
            None => None,
        };
        self.start_with_encoder(capture.zip(encoder))
    }

    /// Start playback and optionally capture with the given encoder
    ///
    /// A capture failure (including denied microphone access) aborts the
    /// start and leaves the session stopped. Fails with
    /// [`Error::SessionClosed`] once [`VoiceSession::stop`] has run.
    pub fn start_with_encoder(
        &mut self,
        capture: Option<(Box<dyn CaptureSource>, Box<dyn FrameEncoder>)>,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        if self.is_running() {
            return Ok(());
        }

        if let Some((mut source, encoder)) = capture {
            let engine = CaptureEngine::new(source.format(), encoder, Arc::clone(&self.transport))?;
            let mut worker =
                CaptureWorker::spawn(engine, self.config.audio.capture_ring_capacity)?;

            if let Err(e) = source.start(worker.handoff()) {
                tracing::error!("Capture failed to start: {}", e);
                worker.stop();
                return Err(e.into());
            }

            self.worker = Some(worker);
            self.capture = Some(source);
        }

        self.timer = Some(PlaybackTimer::spawn(Arc::clone(&self.mixer), TICK_INTERVAL)?);
        tracing::info!(
            "Session started ({})",
            if self.capture.is_some() { "talking" } else { "listening" }
        );
        Ok(())
    }

    /// Stop capture, encoding, playback scheduling and receiving
    pub fn stop(&mut self) {
        let was_running = self.is_running();

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
        if !self.closed {
            self.transport.shutdown();
            self.closed = true;
        }

        if was_running {
            tracing::info!("Session stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    pub fn local_id(&self) -> &SpeakerId {
        self.transport.local_id()
    }

    pub fn mixer(&self) -> &Arc<PlaybackMixer> {
        &self.mixer
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Let the signaling layer drop a participant who left
    pub fn remove_speaker(&self, speaker: &SpeakerId) -> bool {
        self.mixer.remove_speaker(speaker)
    }

    /// Drain errors reported by the input and output devices since the last call
    pub fn device_errors(&self) -> Vec<AudioError> {
        let mut errors = Vec::new();
        if let Some(capture) = self.capture.as_ref() {
            errors.extend(std::iter::from_fn(|| capture.check_errors()));
        }
        errors.extend(self.mixer.sink_errors());
        errors
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            capture: self.worker.as_ref().map(CaptureWorker::stats),
            channels: self.mixer.all_channel_stats(),
            ticks: self.mixer.ticks(),
            connected: self.transport.is_connected(),
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.stop();
    }
}
