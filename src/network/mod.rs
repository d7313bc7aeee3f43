//! Transport seam for encoded voice packets
//!
//! The pipeline never talks to sockets directly. It sends opaque packets
//! through a [`Transport`] and receives `(speaker, packet)` pairs through a
//! [`ReceiveHandler`]. Sender identity lives in the transport, not in the
//! packet.

pub mod memory;
pub mod udp;

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::error::NetworkError;

pub use memory::{MemoryHub, MemoryTransport};
pub use udp::UdpTransport;

/// Identity of a remote participant
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeakerId(String);

impl SpeakerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpeakerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SpeakerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Called for every packet that arrives from a remote speaker
pub type ReceiveHandler = Arc<dyn Fn(SpeakerId, Bytes) + Send + Sync>;

/// Outgoing half of a transport
pub trait Transport: Send + Sync {
    /// Send one packet to every other participant
    fn send(&self, payload: Bytes) -> Result<(), NetworkError>;

    /// Whether packets currently have anywhere to go
    fn is_connected(&self) -> bool;

    /// Identity other participants see for our packets
    fn local_id(&self) -> &SpeakerId;

    /// Stop delivering received packets
    fn shutdown(&self) {}
}
