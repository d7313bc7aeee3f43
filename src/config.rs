//! Application configuration
//!
//! Loaded from a TOML file. Every section has defaults, so an empty file
//! (or no file at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_BITRATE, DEFAULT_CAPTURE_RING_CAPACITY, DEFAULT_JITTER_CAPACITY, DEFAULT_UDP_PORT,
    MAX_DATAGRAM_SIZE, MAX_PACKET_SIZE,
};
use crate::error::ConfigError;

/// Upper bound for any ring buffer capacity we accept from a file
const MAX_RING_CAPACITY: usize = 256;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub identity: IdentityConfig,
    pub audio: AudioConfig,
    pub codec: CodecConfig,
    pub playback: PlaybackConfig,
    pub network: NetworkConfig,
}

/// Local participant identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name attached to every outgoing packet by the transport
    pub name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            name: format!("guest-{}", &id[..8]),
        }
    }
}

/// Hardware audio selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name, `None` for the system default
    pub input_device: Option<String>,
    /// Output device name, `None` for the system default
    pub output_device: Option<String>,
    /// Deliveries buffered between the capture callback and the encoder
    pub capture_ring_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            capture_ring_capacity: DEFAULT_CAPTURE_RING_CAPACITY,
        }
    }
}

/// Opus encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Largest packet the encoder may produce
    pub max_packet_size: usize,
    pub vbr: bool,
    /// Constrained VBR (only meaningful when `vbr` is set)
    pub cvbr: bool,
    /// Expected packet loss hint for the encoder, 0-100
    pub packet_loss_perc: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            bitrate: DEFAULT_BITRATE,
            max_packet_size: MAX_PACKET_SIZE,
            vbr: true,
            cvbr: true,
            packet_loss_perc: 1,
        }
    }
}

/// Receive-side scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Frames held per speaker; worst-case added latency is capacity × 60 ms
    pub jitter_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            jitter_capacity: DEFAULT_JITTER_CAPACITY,
        }
    }
}

/// UDP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: SocketAddr,
    /// Every datagram is sent to each of these
    pub peers: Vec<SocketAddr>,
    /// Kernel send/receive buffer size in bytes
    pub socket_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_UDP_PORT)),
            peers: Vec::new(),
            socket_buffer_size: 256 * 1024,
        }
    }
}

impl AppConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load from `path`, else the default location, else built-in defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Platform config directory, e.g. `~/.config/voice-room/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "voice-room", "voice-room")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.name.is_empty() || self.identity.name.len() > u8::MAX as usize {
            return Err(ConfigError::Invalid(
                "identity.name must be 1-255 bytes".to_string(),
            ));
        }
        if !(1..=MAX_RING_CAPACITY).contains(&self.playback.jitter_capacity) {
            return Err(ConfigError::Invalid(format!(
                "playback.jitter_capacity must be between 1 and {}",
                MAX_RING_CAPACITY
            )));
        }
        if !(1..=MAX_RING_CAPACITY).contains(&self.audio.capture_ring_capacity) {
            return Err(ConfigError::Invalid(format!(
                "audio.capture_ring_capacity must be between 1 and {}",
                MAX_RING_CAPACITY
            )));
        }
        if !(6_000..=510_000).contains(&self.codec.bitrate) {
            return Err(ConfigError::Invalid(
                "codec.bitrate must be between 6000 and 510000".to_string(),
            ));
        }
        // envelope: one length byte plus the sender id
        let packet_budget = MAX_DATAGRAM_SIZE - 1 - self.identity.name.len();
        if !(1..=packet_budget).contains(&self.codec.max_packet_size) {
            return Err(ConfigError::Invalid(format!(
                "codec.max_packet_size must be between 1 and {} for this identity",
                packet_budget
            )));
        }
        if self.codec.packet_loss_perc > 100 {
            return Err(ConfigError::Invalid(
                "codec.packet_loss_perc must be at most 100".to_string(),
            ));
        }
        Ok(())
    }
}
