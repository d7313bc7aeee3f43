//! End-to-end pipeline tests over the in-memory transport

use bytes::Bytes;
use cpal::SampleFormat;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use voice_room::audio::capture::{CaptureHandoff, CaptureSource};
use voice_room::audio::format::{PcmBuffer, PcmFormat, SampleData};
use voice_room::audio::playback::{MemorySink, PlaybackEndpoint, PlaybackSink};
use voice_room::audio::AudioFrame;
use voice_room::codec::{opus_decoder_factory, DecoderFactory, FrameDecoder, OpusEncoder};
use voice_room::config::{AppConfig, CodecConfig, NetworkConfig};
use voice_room::constants::{FRAME_SAMPLES, TICK_INTERVAL};
use voice_room::engine::{ChannelState, PlaybackMixer, PlaybackTimer};
use voice_room::error::{AudioError, CodecError};
use voice_room::network::{MemoryHub, MemoryTransport, ReceiveHandler, Transport, UdpTransport};
use voice_room::{SpeakerId, VoiceSession};

/// Delivers a fixed number of 10 ms stereo f32 buffers at 44.1 kHz
struct ScriptedCapture {
    format: PcmFormat,
    buffers: usize,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ScriptedCapture {
    fn new(buffers: usize) -> Self {
        Self {
            format: PcmFormat::new(44_100, 2, SampleFormat::F32, true).unwrap(),
            buffers,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl CaptureSource for ScriptedCapture {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn start(&mut self, handoff: CaptureHandoff) -> Result<(), AudioError> {
        let format = self.format;
        let buffers = self.buffers;
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        self.handle = Some(thread::spawn(move || {
            for n in 0..buffers {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let samples: Vec<f32> = (0..441 * 2)
                    .map(|i| {
                        let t = (n * 441 + i / 2) as f32 / 44_100.0;
                        (t * 220.0 * 2.0 * std::f32::consts::PI).sin() * 0.3
                    })
                    .collect();
                handoff.deliver(PcmBuffer::new(format, SampleData::F32(samples)));
                // faster than real time, slower than the hand-off can overflow
                thread::sleep(Duration::from_millis(2));
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Capture source whose device refuses access
struct DeniedCapture;

impl CaptureSource for DeniedCapture {
    fn format(&self) -> PcmFormat {
        PcmFormat::canonical()
    }

    fn start(&mut self, _handoff: CaptureHandoff) -> Result<(), AudioError> {
        Err(AudioError::PermissionDenied("user said no".to_string()))
    }

    fn stop(&mut self) {}
}

/// Capture source whose device disappears right after starting
struct UnpluggedCapture {
    lost: Mutex<Option<AudioError>>,
}

impl CaptureSource for UnpluggedCapture {
    fn format(&self) -> PcmFormat {
        PcmFormat::canonical()
    }

    fn start(&mut self, _handoff: CaptureHandoff) -> Result<(), AudioError> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn check_errors(&self) -> Option<AudioError> {
        self.lost.lock().take()
    }
}

/// Memory sink that also reports queued device errors
struct FaultySink {
    inner: MemorySink,
    errors: Mutex<Vec<AudioError>>,
}

impl PlaybackSink for FaultySink {
    fn format(&self) -> PcmFormat {
        self.inner.format()
    }

    fn open_endpoint(&self, name: &str) -> Result<Box<dyn PlaybackEndpoint>, AudioError> {
        self.inner.open_endpoint(name)
    }

    fn check_errors(&self) -> Option<AudioError> {
        self.errors.lock().pop()
    }
}

fn config_for(name: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.identity.name = name.to_string();
    config.audio.capture_ring_capacity = 128;
    config
}

fn join_hub(
    hub: &Arc<MemoryHub>,
    config: AppConfig,
    sink: Arc<MemorySink>,
) -> (VoiceSession, Arc<MemoryTransport>) {
    let mut transport = None;
    let session = VoiceSession::new(config, sink, |id, handler| {
        let joined = Arc::new(hub.join(id, handler));
        transport = Some(joined.clone());
        Ok(joined as Arc<dyn Transport>)
    })
    .unwrap();
    (session, transport.unwrap())
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

/// Two-byte packets `[speaker tag, sequence]` decoded to a constant frame
struct TaggedDecoder;

impl FrameDecoder for TaggedDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<AudioFrame, CodecError> {
        match packet {
            [tag, seq] => AudioFrame::new(vec![tagged_sample(*tag, *seq); FRAME_SAMPLES])
                .map_err(|e| CodecError::DecodingFailed(e.to_string())),
            _ => Err(CodecError::DecodingFailed("expected two bytes".into())),
        }
    }
}

fn tagged_sample(tag: u8, seq: u8) -> i16 {
    i16::from(tag) * 256 + i16::from(seq)
}

fn tagged_factory() -> DecoderFactory {
    Arc::new(|| Ok(Box::new(TaggedDecoder) as Box<dyn FrameDecoder>))
}

fn udp_config(peers: Vec<std::net::SocketAddr>) -> NetworkConfig {
    NetworkConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        peers,
        socket_buffer_size: 64 * 1024,
    }
}

fn opus_packet(value: i16) -> Bytes {
    let mut encoder = OpusEncoder::new(CodecConfig::default()).unwrap();
    let frame = AudioFrame::new(vec![value; FRAME_SAMPLES]).unwrap();
    encoder.encode(&frame).unwrap()
}

#[test]
fn test_capture_reaches_remote_speaker_channel() {
    let hub = MemoryHub::new();
    let alice_sink = Arc::new(MemorySink::new(PcmFormat::canonical()));
    let bob_sink = Arc::new(MemorySink::new(PcmFormat::canonical()));

    let (mut alice, _) = join_hub(&hub, config_for("alice"), alice_sink.clone());
    let (mut bob, _) = join_hub(&hub, config_for("bob"), bob_sink.clone());

    bob.start(None).unwrap();
    // 60 × 10 ms at 44.1 kHz is 0.6 s of audio: ten 60 ms frames
    alice.start(Some(Box::new(ScriptedCapture::new(60)))).unwrap();

    assert!(wait_until(Duration::from_secs(3), || bob_sink.recorded("alice") >= 9));
    assert!(wait_until(Duration::from_secs(1), || {
        alice.stats().capture.map_or(0, |c| c.deliveries) == 60
    }));

    let capture = alice.stats().capture.unwrap();
    assert_eq!(capture.deliveries, 60);
    assert!(capture.packets_sent >= 9, "sent {}", capture.packets_sent);
    assert_eq!(capture.conversion_failures, 0);
    assert_eq!(capture.encode_failures, 0);

    // Bob knows alice only; alice heard nobody
    assert_eq!(bob.mixer().speakers(), vec![SpeakerId::from("alice")]);
    assert_eq!(alice.mixer().channel_count(), 0);

    for buffer in bob_sink.take("alice") {
        assert_eq!(buffer.frame_count(), FRAME_SAMPLES);
        assert!(buffer.format().is_canonical());
    }

    alice.stop();
    bob.stop();
    assert!(!alice.is_running());
}

#[test]
fn test_two_speakers_stay_isolated() {
    let sink = Arc::new(MemorySink::new(PcmFormat::canonical()));
    let mixer = PlaybackMixer::new(sink.clone(), opus_decoder_factory(), 32);
    let loud = opus_packet(8_000);
    let quiet = opus_packet(0);

    for _ in 0..5 {
        mixer.on_packet(SpeakerId::from("loud"), &loud).unwrap();
        mixer.on_packet(SpeakerId::from("quiet"), &quiet).unwrap();
    }

    let loud_stats = mixer.channel_stats(&SpeakerId::from("loud")).unwrap();
    let quiet_stats = mixer.channel_stats(&SpeakerId::from("quiet")).unwrap();
    assert_eq!(loud_stats.packets_received, 5);
    assert_eq!(quiet_stats.packets_received, 5);
    assert_eq!(loud_stats.buffered_frames, 5);
    assert_eq!(quiet_stats.buffered_frames, 5);

    for _ in 0..5 {
        let report = mixer.tick();
        assert_eq!(report.frames_submitted, 2);
    }

    let quiet_peak = sink
        .take("quiet")
        .iter()
        .flat_map(|b| b.as_i16().unwrap().to_vec())
        .map(|s| s.saturating_abs())
        .max()
        .unwrap();
    assert!(quiet_peak < 64, "silent speaker leaked audio: {}", quiet_peak);
    assert_eq!(sink.take("loud").len(), 5);
}

#[test]
fn test_slow_sender_causes_gaps_not_stalls() {
    let sink = Arc::new(MemorySink::new(PcmFormat::canonical()));
    let mixer = Arc::new(PlaybackMixer::new(sink.clone(), opus_decoder_factory(), 32));
    let mut timer = PlaybackTimer::spawn(mixer.clone(), TICK_INTERVAL).unwrap();

    let packet = opus_packet(1_000);
    let speaker = SpeakerId::from("laggy");
    let sent = 12;
    for _ in 0..sent {
        mixer.on_packet(speaker.clone(), &packet).unwrap();
        thread::sleep(Duration::from_millis(90));
    }

    // Ring drains at one frame per tick once the sender is done
    assert!(wait_until(Duration::from_secs(2), || {
        mixer.channel_stats(&speaker).unwrap().frames_played == sent
    }));

    let ticks_before = mixer.ticks();
    thread::sleep(TICK_INTERVAL * 4);
    assert!(mixer.ticks() > ticks_before, "tick loop stalled");
    timer.stop();

    let stats = mixer.channel_stats(&speaker).unwrap();
    assert!(stats.gaps > 0, "expected skipped ticks");
    assert_eq!(stats.overflows, 0);
    assert_eq!(stats.state, ChannelState::Playing);

    assert_eq!(sink.take("laggy").len() as u64, sent);
    assert_eq!(
        mixer.channel_stats(&speaker).unwrap().state,
        ChannelState::Idle
    );
}

#[test]
fn test_disconnect_makes_send_and_playback_noops() {
    let hub = MemoryHub::new();
    let alice_sink = Arc::new(MemorySink::new(PcmFormat::canonical()));
    let bob_sink = Arc::new(MemorySink::new(PcmFormat::canonical()));

    let (mut alice, alice_transport) = join_hub(&hub, config_for("alice"), alice_sink);
    let (bob, bob_transport) = join_hub(&hub, config_for("bob"), bob_sink.clone());

    alice_transport.set_connected(false);
    alice.start(Some(Box::new(ScriptedCapture::new(60)))).unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        alice.stats().capture.map_or(0, |c| c.deliveries) == 60
    }));
    assert!(wait_until(Duration::from_secs(1), || {
        alice.stats().capture.map_or(0, |c| c.packets_discarded) >= 9
    }));

    let capture = alice.stats().capture.unwrap();
    assert_eq!(capture.packets_sent, 0);
    assert_eq!(bob.mixer().channel_count(), 0);
    alice.stop();

    // Receive side: buffered audio waits while bob is offline
    bob.mixer()
        .on_packet(SpeakerId::from("carol"), &opus_packet(0))
        .unwrap();
    bob_transport.set_connected(false);
    assert!(bob.mixer().tick().suspended);
    assert_eq!(bob_sink.recorded("carol"), 0);

    bob_transport.set_connected(true);
    assert_eq!(bob.mixer().tick().frames_submitted, 1);
    assert_eq!(bob_sink.recorded("carol"), 1);
}

#[test]
fn test_permission_denied_aborts_start() {
    let hub = MemoryHub::new();
    let sink = Arc::new(MemorySink::new(PcmFormat::canonical()));
    let (mut session, _) = join_hub(&hub, config_for("dave"), sink);

    let err = session.start(Some(Box::new(DeniedCapture))).unwrap_err();
    assert!(matches!(
        err,
        voice_room::Error::Audio(AudioError::PermissionDenied(_))
    ));
    assert!(!session.is_running());
}

#[test]
fn test_stopped_session_cannot_restart() {
    let hub = MemoryHub::new();
    let sink = Arc::new(MemorySink::new(PcmFormat::canonical()));
    let (mut session, _) = join_hub(&hub, config_for("hank"), sink);

    session.start(None).unwrap();
    assert_eq!(hub.member_count(), 1);
    session.stop();
    assert_eq!(hub.member_count(), 0);

    assert!(matches!(
        session.start(None),
        Err(voice_room::Error::SessionClosed)
    ));
    assert!(!session.is_running());
    // stopping again is harmless
    session.stop();
}

#[test]
fn test_device_errors_surface_through_session() {
    let hub = MemoryHub::new();
    let sink = Arc::new(FaultySink {
        inner: MemorySink::new(PcmFormat::canonical()),
        errors: Mutex::new(vec![AudioError::StreamError("output unplugged".into())]),
    });
    let mut session = VoiceSession::new(config_for("gina"), sink, |id, handler| {
        Ok(Arc::new(hub.join(id, handler)) as Arc<dyn Transport>)
    })
    .unwrap();

    session
        .start(Some(Box::new(UnpluggedCapture {
            lost: Mutex::new(Some(AudioError::StreamError("input unplugged".into()))),
        })))
        .unwrap();

    let errors = session.device_errors();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| matches!(e, AudioError::StreamError(_))));
    assert!(session.device_errors().is_empty());
    session.stop();
}

#[test]
fn test_remove_speaker_after_leave() {
    let hub = MemoryHub::new();
    let sink = Arc::new(MemorySink::new(PcmFormat::canonical()));
    let (session, _) = join_hub(&hub, config_for("erin"), sink);

    session
        .mixer()
        .on_packet(SpeakerId::from("frank"), &opus_packet(0))
        .unwrap();
    assert_eq!(session.mixer().channel_count(), 1);
    assert!(session.remove_speaker(&SpeakerId::from("frank")));
    assert_eq!(session.mixer().channel_count(), 0);
}

#[test]
fn test_udp_listener_without_peers_plays_received_audio() {
    let sink = Arc::new(MemorySink::new(PcmFormat::canonical()));
    let mixer = Arc::new(PlaybackMixer::new(sink.clone(), opus_decoder_factory(), 32));
    let listener = Arc::new(
        UdpTransport::bind(&udp_config(vec![]), SpeakerId::from("listener"), mixer.receive_handler())
            .unwrap(),
    );
    assert!(mixer.attach_transport(listener.clone()));

    mixer
        .on_packet(SpeakerId::from("talker"), &opus_packet(500))
        .unwrap();
    let report = mixer.tick();
    assert!(!report.suspended);
    assert_eq!(report.frames_submitted, 1);
    assert_eq!(sink.recorded("talker"), 1);

    // Same path over a real socket
    let noop: ReceiveHandler = Arc::new(|_, _| {});
    let remote = UdpTransport::bind(
        &udp_config(vec![listener.local_addr().unwrap()]),
        SpeakerId::from("remote"),
        noop,
    )
    .unwrap();
    remote.send(opus_packet(500)).unwrap();

    let speaker = SpeakerId::from("remote");
    assert!(wait_until(Duration::from_secs(2), || {
        mixer
            .channel_stats(&speaker)
            .map_or(0, |stats| stats.buffered_frames)
            == 1
    }));
    assert_eq!(mixer.tick().frames_submitted, 1);
    assert_eq!(sink.recorded("remote"), 1);

    remote.stop();
    listener.stop();
}

proptest! {
    #[test]
    fn prop_interleaved_speakers_keep_their_own_order(order in prop::collection::vec(any::<bool>(), 1..48)) {
        let sink = Arc::new(MemorySink::new(PcmFormat::canonical()));
        let mixer = PlaybackMixer::new(sink.clone(), tagged_factory(), 64);

        let mut sent = [0u8; 2];
        for &second in &order {
            let tag = usize::from(second);
            mixer
                .on_packet(SpeakerId::from(["a", "b"][tag]), &[tag as u8 + 1, sent[tag]])
                .unwrap();
            sent[tag] += 1;
        }

        let most = *sent.iter().max().unwrap();
        for _ in 0..most {
            mixer.tick();
        }

        for (tag, name) in ["a", "b"].iter().enumerate() {
            let played = sink.take(name);
            prop_assert_eq!(played.len(), usize::from(sent[tag]));
            for (seq, buffer) in played.iter().enumerate() {
                let expected = tagged_sample(tag as u8 + 1, seq as u8);
                prop_assert!(buffer.as_i16().unwrap().iter().all(|&s| s == expected));
            }
        }
    }
}
