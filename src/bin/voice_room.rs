//! Voice Room
//!
//! Joins a voice room over UDP (or talks to itself with `--loopback`),
//! capturing the microphone and playing every remote speaker until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_room::{
    audio::{
        capture::{CaptureSource, CpalCapture},
        device::list_devices,
        playback::{CpalPlaybackSink, PlaybackSink},
    },
    config::AppConfig,
    network::{MemoryHub, Transport, UdpTransport},
    VoiceSession,
};

/// Real-time multi-participant voice chat
#[derive(Parser, Debug)]
#[command(name = "voice-room", version, about)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "VOICE_ROOM_CONFIG")]
    config: Option<PathBuf>,

    /// Name other participants see
    #[arg(short, long, env = "VOICE_ROOM_NAME")]
    name: Option<String>,

    /// Local UDP address to bind
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Peer to send voice to (repeatable)
    #[arg(short, long = "peer")]
    peers: Vec<SocketAddr>,

    /// Print audio devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Hear yourself through an in-process transport instead of UDP
    #[arg(long)]
    loopback: bool,

    /// Do not open the microphone
    #[arg(long)]
    listen_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if cli.list_devices {
        print_devices();
        return Ok(());
    }

    let mut config = AppConfig::load_or_default(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(name) = cli.name {
        config.identity.name = name;
    }
    if let Some(bind) = cli.bind {
        config.network.bind_address = bind;
    }
    config.network.peers.extend(cli.peers);
    config.validate().context("invalid configuration")?;

    tracing::info!("Starting voice room as {}", config.identity.name);

    let sink: Arc<dyn PlaybackSink> = Arc::new(
        CpalPlaybackSink::new(config.audio.output_device.as_deref())
            .context("failed to open output device")?,
    );

    let loopback = cli.loopback;
    let network = config.network.clone();
    let mut session = VoiceSession::new(config.clone(), sink, move |id, handler| {
        let transport: Arc<dyn Transport> = if loopback {
            tracing::info!("Loopback mode: your voice comes straight back");
            Arc::new(MemoryHub::with_echo().join(id, handler))
        } else {
            Arc::new(UdpTransport::bind(&network, id, handler)?)
        };
        Ok(transport)
    })?;

    let capture: Option<Box<dyn CaptureSource>> = if cli.listen_only {
        None
    } else {
        Some(Box::new(
            CpalCapture::new(config.audio.input_device.as_deref())
                .context("failed to open input device")?,
        ))
    };
    session.start(capture).context("failed to start session")?;

    if !loopback && config.network.peers.is_empty() {
        tracing::warn!("No peers configured; listening only until one is added");
    }
    tracing::info!("Press Ctrl+C to leave");

    let mut stats_interval = tokio::time::interval(Duration::from_secs(10));
    stats_interval.tick().await;
    let mut health_interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
            _ = stats_interval.tick() => {
                log_stats(&session);
            }
            _ = health_interval.tick() => {
                for error in session.device_errors() {
                    tracing::error!("Audio device error: {}", error);
                }
            }
        }
    }

    session.stop();
    Ok(())
}

fn print_devices() {
    println!("\n=== Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

fn log_stats(session: &VoiceSession) {
    let stats = session.stats();
    if let Some(capture) = stats.capture {
        tracing::info!(
            "Sent {} packets ({} frames encoded, {} discarded offline, {} send errors)",
            capture.packets_sent,
            capture.frames_encoded,
            capture.packets_discarded,
            capture.send_errors
        );
    }
    for channel in stats.channels {
        tracing::info!(
            "{}: {:?}, {} buffered, {} played, {} gaps, {} overflows",
            channel.speaker,
            channel.state,
            channel.buffered_frames,
            channel.frames_played,
            channel.gaps,
            channel.overflows
        );
    }
}
