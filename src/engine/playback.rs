//! Receive path: per-speaker jitter buffers drained on a fixed tick
//!
//! Packets are decoded and converted the moment they arrive, then parked in
//! the speaker's ring buffer. Independently of arrival timing, every 60 ms
//! [`PlaybackMixer::tick`] moves at most one frame per speaker to the
//! output. An empty ring is a gap for that tick, never a wait, so
//! worst-case added latency is `capacity × 60 ms`.

use crossbeam_channel::{bounded, select, tick, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::RingBuffer;
use crate::audio::format::{FormatConverter, PcmBuffer, PcmFormat};
use crate::audio::playback::{PlaybackEndpoint, PlaybackSink};
use crate::codec::{DecoderFactory, FrameDecoder};
use crate::error::{AudioError, Error};
use crate::network::{ReceiveHandler, SpeakerId, Transport};

/// Whether a channel's endpoint currently has audio queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Playing,
}

/// Per-speaker counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    pub speaker: SpeakerId,
    pub state: ChannelState,
    pub buffered_frames: usize,
    pub packets_received: u64,
    pub decode_failures: u64,
    pub conversion_failures: u64,
    pub frames_played: u64,
    /// Ticks that found this channel's ring empty
    pub gaps: u64,
    /// Frames evicted because the ring was full
    pub overflows: u64,
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub frames_submitted: usize,
    pub channels_skipped: usize,
    /// Transport was down; nothing was touched
    pub suspended: bool,
}

/// Decoder and converter for one incoming stream
struct ChannelDecoder {
    decoder: Box<dyn FrameDecoder>,
    converter: Option<FormatConverter>,
}

/// Everything the mixer keeps for one remote speaker
pub struct PlaybackChannel {
    speaker: SpeakerId,
    ring: RingBuffer<PcmBuffer>,
    decoder: Mutex<ChannelDecoder>,
    endpoint: Mutex<Box<dyn PlaybackEndpoint>>,
    packets_received: AtomicU64,
    decode_failures: AtomicU64,
    conversion_failures: AtomicU64,
    frames_played: AtomicU64,
    gaps: AtomicU64,
}

impl PlaybackChannel {
    fn new(
        speaker: SpeakerId,
        capacity: usize,
        decoder: Box<dyn FrameDecoder>,
        sink_format: PcmFormat,
        endpoint: Box<dyn PlaybackEndpoint>,
    ) -> Result<Self, AudioError> {
        let converter = if FormatConverter::needs_conversion(&PcmFormat::canonical(), &sink_format) {
            Some(FormatConverter::from_canonical(sink_format)?)
        } else {
            None
        };

        Ok(Self {
            speaker,
            ring: RingBuffer::new(capacity),
            decoder: Mutex::new(ChannelDecoder { decoder, converter }),
            endpoint: Mutex::new(endpoint),
            packets_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            conversion_failures: AtomicU64::new(0),
            frames_played: AtomicU64::new(0),
            gaps: AtomicU64::new(0),
        })
    }

    /// Decode and convert one packet into the jitter buffer
    fn accept(&self, packet: &[u8]) -> Result<(), Error> {
        self.packets_received.fetch_add(1, Ordering::Relaxed);

        let buffer = {
            let mut state = self.decoder.lock();
            let frame = match state.decoder.decode(packet) {
                Ok(frame) => frame,
                Err(e) => {
                    self.decode_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e.into());
                }
            };

            let canonical = PcmBuffer::from_frame(frame);
            match state.converter.as_mut() {
                None => canonical,
                Some(converter) => match converter.convert(&canonical) {
                    Ok(converted) => converted,
                    Err(e) => {
                        self.conversion_failures.fetch_add(1, Ordering::Relaxed);
                        return Err(e.into());
                    }
                },
            }
        };

        self.ring.write(buffer);
        Ok(())
    }

    /// Move at most one frame to the endpoint; `false` if the ring was empty
    fn play_one(&self) -> bool {
        let Some(buffer) = self.ring.read() else {
            self.gaps.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        match self.endpoint.lock().submit(buffer) {
            Ok(()) => {
                self.frames_played.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!("Playback submit for {} failed: {}", self.speaker, e);
                false
            }
        }
    }

    pub fn state(&self) -> ChannelState {
        if self.endpoint.lock().queued() > Duration::ZERO {
            ChannelState::Playing
        } else {
            ChannelState::Idle
        }
    }

    pub fn buffered_frames(&self) -> usize {
        self.ring.len()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            speaker: self.speaker.clone(),
            state: self.state(),
            buffered_frames: self.ring.len(),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            conversion_failures: self.conversion_failures.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            overflows: self.ring.overflow_count() as u64,
        }
    }
}

/// Owns one [`PlaybackChannel`] per remote speaker
pub struct PlaybackMixer {
    channels: DashMap<SpeakerId, Arc<PlaybackChannel>>,
    sink: Arc<dyn PlaybackSink>,
    decoder_factory: DecoderFactory,
    jitter_capacity: usize,
    /// Playback is suspended while this reports disconnected
    link: OnceLock<Arc<dyn Transport>>,
    ticks: AtomicU64,
}

impl PlaybackMixer {
    pub fn new(
        sink: Arc<dyn PlaybackSink>,
        decoder_factory: DecoderFactory,
        jitter_capacity: usize,
    ) -> Self {
        Self {
            channels: DashMap::new(),
            sink,
            decoder_factory,
            jitter_capacity: jitter_capacity.max(1),
            link: OnceLock::new(),
            ticks: AtomicU64::new(0),
        }
    }

    /// Suspend ticking whenever `transport` is disconnected
    ///
    /// Only the first transport attached is kept.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) -> bool {
        self.link.set(transport).is_ok()
    }

    /// Handler that feeds received packets into this mixer
    ///
    /// Holds the mixer weakly, since the transport owning the handler is
    /// usually attached to the same mixer.
    pub fn receive_handler(self: &Arc<Self>) -> ReceiveHandler {
        let mixer: Weak<PlaybackMixer> = Arc::downgrade(self);
        Arc::new(move |speaker, packet| {
            if let Some(mixer) = mixer.upgrade() {
                let _ = mixer.on_packet(speaker, &packet);
            }
        })
    }

    /// Handle a packet from `speaker`, creating its channel on first sight
    ///
    /// Failures drop the packet; the error is returned for inspection and
    /// already logged.
    pub fn on_packet(&self, speaker: SpeakerId, packet: &[u8]) -> Result<(), Error> {
        let channel = self.channel_for(speaker)?;
        channel.accept(packet).map_err(|e| {
            tracing::debug!("Dropping packet from {}: {}", channel.speaker, e);
            e
        })
    }

    fn channel_for(&self, speaker: SpeakerId) -> Result<Arc<PlaybackChannel>, Error> {
        if let Some(channel) = self.channels.get(&speaker) {
            return Ok(Arc::clone(channel.value()));
        }

        match self.channels.entry(speaker) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let speaker = entry.key().clone();
                let decoder = (self.decoder_factory)().map_err(|e| {
                    tracing::warn!("No decoder for new speaker {}: {}", speaker, e);
                    e
                })?;
                let endpoint = self.sink.open_endpoint(speaker.as_str()).map_err(|e| {
                    tracing::warn!("No playback endpoint for {}: {}", speaker, e);
                    e
                })?;

                let channel = Arc::new(PlaybackChannel::new(
                    speaker.clone(),
                    self.jitter_capacity,
                    decoder,
                    self.sink.format(),
                    endpoint,
                )?);
                entry.insert(Arc::clone(&channel));
                tracing::info!("New speaker {}", speaker);
                Ok(channel)
            }
        }
    }

    /// Submit at most one frame per channel
    pub fn tick(&self) -> TickReport {
        self.ticks.fetch_add(1, Ordering::Relaxed);

        if let Some(link) = self.link.get() {
            if !link.is_connected() {
                return TickReport {
                    suspended: true,
                    ..TickReport::default()
                };
            }
        }

        // Snapshot so endpoint work never holds a map shard
        let channels: Vec<Arc<PlaybackChannel>> = self
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut report = TickReport::default();
        for channel in channels {
            if channel.play_one() {
                report.frames_submitted += 1;
            } else {
                report.channels_skipped += 1;
            }
        }
        report
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn speakers(&self) -> Vec<SpeakerId> {
        let mut speakers: Vec<SpeakerId> =
            self.channels.iter().map(|entry| entry.key().clone()).collect();
        speakers.sort();
        speakers
    }

    pub fn channel_stats(&self, speaker: &SpeakerId) -> Option<ChannelStats> {
        self.channels.get(speaker).map(|channel| channel.stats())
    }

    pub fn all_channel_stats(&self) -> Vec<ChannelStats> {
        let mut stats: Vec<ChannelStats> =
            self.channels.iter().map(|entry| entry.value().stats()).collect();
        stats.sort_by(|a, b| a.speaker.cmp(&b.speaker));
        stats
    }

    /// Drop a speaker's channel, closing its endpoint
    pub fn remove_speaker(&self, speaker: &SpeakerId) -> bool {
        let removed = self.channels.remove(speaker).is_some();
        if removed {
            tracing::info!("Removed speaker {}", speaker);
        }
        removed
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Drain errors the output device reported since the last call
    pub fn sink_errors(&self) -> Vec<AudioError> {
        std::iter::from_fn(|| self.sink.check_errors()).collect()
    }
}

/// Calls [`PlaybackMixer::tick`] on a fixed period from its own thread
pub struct PlaybackTimer {
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackTimer {
    pub fn spawn(mixer: Arc<PlaybackMixer>, interval: Duration) -> Result<Self, AudioError> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("playback-timer".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                let mut slow_ticks = 0u64;
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let started = Instant::now();
                            mixer.tick();
                            if started.elapsed() > interval {
                                slow_ticks += 1;
                                tracing::warn!(
                                    "Playback tick took {:?} ({} slow so far)",
                                    started.elapsed(),
                                    slow_ticks
                                );
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                tracing::debug!("Playback timer stopped");
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn stop(&mut self) {
        // Dropping the sender wakes the select
        self.shutdown_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PlaybackTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::AudioFrame;
    use crate::audio::playback::MemorySink;
    use crate::constants::FRAME_SAMPLES;
    use crate::error::CodecError;
    use crate::network::MemoryHub;
    use cpal::SampleFormat;

    /// Packet is a single byte; the frame is filled with it
    struct ByteDecoder;

    impl FrameDecoder for ByteDecoder {
        fn decode(&mut self, packet: &[u8]) -> Result<AudioFrame, CodecError> {
            match packet {
                [value] => AudioFrame::new(vec![*value as i16; FRAME_SAMPLES])
                    .map_err(|e| CodecError::DecodingFailed(e.to_string())),
                _ => Err(CodecError::DecodingFailed("bad test packet".into())),
            }
        }
    }

    fn byte_factory() -> DecoderFactory {
        Arc::new(|| Ok(Box::new(ByteDecoder) as Box<dyn FrameDecoder>))
    }

    fn mixer(capacity: usize) -> (PlaybackMixer, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new(PcmFormat::canonical()));
        (PlaybackMixer::new(sink.clone(), byte_factory(), capacity), sink)
    }

    fn first_sample(buffer: &PcmBuffer) -> i16 {
        buffer.as_i16().unwrap()[0]
    }

    #[test]
    fn test_channels_created_lazily() {
        let (mixer, sink) = mixer(4);
        assert_eq!(mixer.channel_count(), 0);

        mixer.on_packet(SpeakerId::from("a"), &[1]).unwrap();
        mixer.on_packet(SpeakerId::from("a"), &[2]).unwrap();
        mixer.on_packet(SpeakerId::from("b"), &[3]).unwrap();

        assert_eq!(mixer.channel_count(), 2);
        assert_eq!(mixer.speakers(), vec![SpeakerId::from("a"), SpeakerId::from("b")]);
        assert_eq!(sink.stream_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_tick_plays_one_frame_per_channel() {
        let (mixer, sink) = mixer(8);
        for value in 1..=3 {
            mixer.on_packet(SpeakerId::from("a"), &[value]).unwrap();
        }
        mixer.on_packet(SpeakerId::from("b"), &[9]).unwrap();

        let report = mixer.tick();
        assert_eq!(report.frames_submitted, 2);
        assert_eq!(report.channels_skipped, 0);

        let report = mixer.tick();
        assert_eq!(report.frames_submitted, 1);
        assert_eq!(report.channels_skipped, 1);

        let a: Vec<i16> = sink.take("a").iter().map(first_sample).collect();
        assert_eq!(a, vec![1, 2]);
        let b: Vec<i16> = sink.take("b").iter().map(first_sample).collect();
        assert_eq!(b, vec![9]);

        let stats = mixer.channel_stats(&SpeakerId::from("b")).unwrap();
        assert_eq!(stats.gaps, 1);
        assert_eq!(stats.frames_played, 1);
    }

    #[test]
    fn test_full_ring_keeps_newest() {
        let (mixer, sink) = mixer(2);
        for value in 1..=5 {
            mixer.on_packet(SpeakerId::from("a"), &[value]).unwrap();
        }
        mixer.tick();
        mixer.tick();
        mixer.tick();

        let played: Vec<i16> = sink.take("a").iter().map(first_sample).collect();
        assert_eq!(played, vec![4, 5]);
        assert_eq!(mixer.channel_stats(&SpeakerId::from("a")).unwrap().overflows, 3);
    }

    #[test]
    fn test_bad_packet_is_dropped_and_counted() {
        let (mixer, _) = mixer(4);
        assert!(mixer.on_packet(SpeakerId::from("a"), &[1, 2]).is_err());

        let stats = mixer.channel_stats(&SpeakerId::from("a")).unwrap();
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.buffered_frames, 0);
    }

    #[test]
    fn test_frames_converted_to_sink_format() {
        let format = PcmFormat::new(44_100, 2, SampleFormat::F32, true).unwrap();
        let sink = Arc::new(MemorySink::new(format));
        let mixer = PlaybackMixer::new(sink.clone(), byte_factory(), 4);

        mixer.on_packet(SpeakerId::from("a"), &[0]).unwrap();
        mixer.tick();

        let played = sink.take("a");
        assert_eq!(played.len(), 1);
        assert_eq!(*played[0].format(), format);
        // 2880 frames at 48 kHz -> 2646 at 44.1 kHz, two channels each
        assert_eq!(played[0].frame_count(), 2646);
    }

    #[test]
    fn test_state_follows_endpoint_queue() {
        let (mixer, sink) = mixer(4);
        let speaker = SpeakerId::from("a");
        mixer.on_packet(speaker.clone(), &[1]).unwrap();
        assert_eq!(mixer.channel_stats(&speaker).unwrap().state, ChannelState::Idle);

        mixer.tick();
        assert_eq!(mixer.channel_stats(&speaker).unwrap().state, ChannelState::Playing);

        sink.take("a");
        assert_eq!(mixer.channel_stats(&speaker).unwrap().state, ChannelState::Idle);
    }

    #[test]
    fn test_remove_speaker() {
        let (mixer, _) = mixer(4);
        mixer.on_packet(SpeakerId::from("a"), &[1]).unwrap();
        assert!(mixer.remove_speaker(&SpeakerId::from("a")));
        assert!(!mixer.remove_speaker(&SpeakerId::from("a")));
        assert_eq!(mixer.channel_count(), 0);
        assert_eq!(mixer.tick().channels_skipped, 0);
    }

    #[test]
    fn test_disconnected_link_suspends_tick() {
        let hub = MemoryHub::new();
        let transport = Arc::new(hub.join(SpeakerId::from("me"), Arc::new(|_, _| {})));
        let sink = Arc::new(MemorySink::new(PcmFormat::canonical()));
        let mixer = PlaybackMixer::new(sink.clone(), byte_factory(), 4);
        assert!(mixer.attach_transport(transport.clone()));

        mixer.on_packet(SpeakerId::from("a"), &[1]).unwrap();
        transport.set_connected(false);
        let report = mixer.tick();
        assert!(report.suspended);
        assert_eq!(sink.recorded("a"), 0);

        transport.set_connected(true);
        assert_eq!(mixer.tick().frames_submitted, 1);
        assert_eq!(sink.recorded("a"), 1);
    }

    #[test]
    fn test_receive_handler_feeds_mixer() {
        let (mixer, _) = mixer(4);
        let mixer = Arc::new(mixer);
        let handler = mixer.receive_handler();

        handler(SpeakerId::from("a"), bytes::Bytes::from_static(&[7]));
        assert_eq!(mixer.channel_stats(&SpeakerId::from("a")).unwrap().buffered_frames, 1);

        drop(mixer);
        // mixer gone: handler quietly does nothing
        handler(SpeakerId::from("a"), bytes::Bytes::from_static(&[7]));
    }

    #[test]
    fn test_timer_ticks_and_stops() {
        let (mixer, _) = mixer(4);
        let mixer = Arc::new(mixer);
        let mut timer = PlaybackTimer::spawn(mixer.clone(), Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(60));
        timer.stop();

        let ticks = mixer.ticks();
        assert!(ticks >= 3, "only {} ticks", ticks);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(mixer.ticks(), ticks);
        assert!(!timer.is_running());
    }
}
