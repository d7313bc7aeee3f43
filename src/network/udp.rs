//! UDP transport
//!
//! Each datagram carries one encoded packet behind a small envelope naming
//! the sender:
//!
//! ```text
//! ┌──────────┬──────────────────┬──────────────────────┐
//! │ id_len   │ sender id (utf8) │ payload (Opus)       │
//! │ 1 byte   │ id_len bytes     │ rest of the datagram │
//! └──────────┴──────────────────┴──────────────────────┘
//! ```
//!
//! Packets go to every configured peer. A background thread receives
//! datagrams and hands `(speaker, payload)` to the receive handler.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::NetworkError;
use crate::network::{ReceiveHandler, SpeakerId, Transport};

/// How often the receive thread wakes up to check for shutdown
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Wrap a payload in the sender envelope
pub fn encode_datagram(sender: &SpeakerId, payload: &[u8]) -> Result<Bytes, NetworkError> {
    let id = sender.as_str().as_bytes();
    if id.is_empty() || id.len() > u8::MAX as usize {
        return Err(NetworkError::InvalidPacket);
    }

    let total = 1 + id.len() + payload.len();
    if total > MAX_DATAGRAM_SIZE {
        return Err(NetworkError::PacketTooLarge(total));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(id.len() as u8);
    buf.put_slice(id);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split a datagram into sender and payload
pub fn decode_datagram(datagram: &[u8]) -> Result<(SpeakerId, Bytes), NetworkError> {
    let (&id_len, rest) = datagram.split_first().ok_or(NetworkError::InvalidPacket)?;
    let id_len = id_len as usize;
    if id_len == 0 || rest.len() <= id_len {
        return Err(NetworkError::InvalidPacket);
    }

    let id = std::str::from_utf8(&rest[..id_len]).map_err(|_| NetworkError::InvalidPacket)?;
    Ok((
        SpeakerId::new(id),
        Bytes::copy_from_slice(&rest[id_len..]),
    ))
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct UdpStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub invalid_datagrams: u64,
    pub send_errors: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    invalid: AtomicU64,
    send_errors: AtomicU64,
}

/// UDP transport sending to a fixed set of peers
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_id: SpeakerId,
    peers: RwLock<Vec<SocketAddr>>,
    running: Arc<AtomicBool>,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl UdpTransport {
    /// Bind the socket and start the receive thread
    pub fn bind(
        config: &NetworkConfig,
        local_id: SpeakerId,
        handler: ReceiveHandler,
    ) -> Result<Self, NetworkError> {
        if local_id.as_str().is_empty() || local_id.as_str().len() > u8::MAX as usize {
            return Err(NetworkError::BindFailed(
                "local id must be 1-255 bytes".to_string(),
            ));
        }

        let socket = create_socket(config)?;
        let socket = Arc::new(socket);
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let handle = {
            let socket = Arc::clone(&socket);
            let running = Arc::clone(&running);
            let counters = Arc::clone(&counters);
            let local_id = local_id.clone();
            thread::Builder::new()
                .name("udp-receive".to_string())
                .spawn(move || receive_loop(socket, local_id, handler, running, counters))
                .map_err(|e| NetworkError::BindFailed(e.to_string()))?
        };

        tracing::info!(
            "UDP transport bound to {} with {} peer(s)",
            config.bind_address,
            config.peers.len()
        );

        Ok(Self {
            socket,
            local_id,
            peers: RwLock::new(config.peers.clone()),
            running,
            receive_thread: Mutex::new(Some(handle)),
            counters,
        })
    }

    /// Address the socket is actually bound to
    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))
    }

    pub fn add_peer(&self, peer: SocketAddr) {
        let mut peers = self.peers.write();
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }

    pub fn remove_peer(&self, peer: &SocketAddr) {
        self.peers.write().retain(|p| p != peer);
    }

    /// Whether sends currently go anywhere
    pub fn has_peers(&self) -> bool {
        !self.peers.read().is_empty()
    }

    pub fn stats(&self) -> UdpStats {
        UdpStats {
            datagrams_sent: self.counters.sent.load(Ordering::Relaxed),
            datagrams_received: self.counters.received.load(Ordering::Relaxed),
            invalid_datagrams: self.counters.invalid.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
        }
    }

    /// Stop the receive thread
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.receive_thread.lock().take() {
            // The last reference can be dropped from inside the handler
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Transport for UdpTransport {
    fn send(&self, payload: Bytes) -> Result<(), NetworkError> {
        if !self.is_connected() {
            return Err(NetworkError::Disconnected);
        }

        let datagram = encode_datagram(&self.local_id, &payload)?;
        // No peers yet is a quiet room, not a broken link
        let peers = self.peers.read().clone();

        let mut last_error = None;
        for peer in &peers {
            match self.socket.send_to(&datagram, peer) {
                Ok(_) => {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Send to {} failed: {}", peer, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(NetworkError::SendFailed(e.to_string())),
            None => Ok(()),
        }
    }

    /// Connected while the socket is open and the receive loop runs
    fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn local_id(&self) -> &SpeakerId {
        &self.local_id
    }

    fn shutdown(&self) {
        self.stop();
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Create a UDP socket with the configured buffer sizes
fn create_socket(config: &NetworkConfig) -> Result<UdpSocket, NetworkError> {
    let address = config.bind_address;
    let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    // Buffer sizes are a hint; some platforms clamp them
    if let Err(e) = socket.set_recv_buffer_size(config.socket_buffer_size) {
        tracing::warn!("Failed to set receive buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(config.socket_buffer_size) {
        tracing::warn!("Failed to set send buffer size: {}", e);
    }

    socket
        .bind(&address.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", address, e)))?;

    let socket: UdpSocket = socket.into();
    socket
        .set_read_timeout(Some(RECEIVE_TIMEOUT))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(socket)
}

fn receive_loop(
    socket: Arc<UdpSocket>,
    local_id: SpeakerId,
    handler: ReceiveHandler,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];

    while running.load(Ordering::Relaxed) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => {
                tracing::debug!("Receive error: {}", e);
                continue;
            }
        };

        if len > MAX_DATAGRAM_SIZE {
            counters.invalid.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Oversized datagram from {}", from);
            continue;
        }

        match decode_datagram(&buf[..len]) {
            Ok((speaker, _)) if speaker == local_id => {}
            Ok((speaker, payload)) => {
                counters.received.fetch_add(1, Ordering::Relaxed);
                handler(speaker, payload);
            }
            Err(_) => {
                counters.invalid.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Malformed datagram from {}", from);
            }
        }
    }

    tracing::debug!("UDP receive loop stopped");
}
