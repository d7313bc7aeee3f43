//! In-process transport
//!
//! Every participant joins a shared [`MemoryHub`]. A send is delivered
//! synchronously, on the sender's thread, to every other member's handler.
//! Used by the integration tests and the `--loopback` mode of the binary.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::NetworkError;
use crate::network::{ReceiveHandler, SpeakerId, Transport};

/// Shared room all memory transports deliver through
pub struct MemoryHub {
    members: RwLock<Vec<(SpeakerId, ReceiveHandler)>>,
    /// Deliver packets back to their sender as well
    echo: bool,
    delivered: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            members: RwLock::new(Vec::new()),
            echo: false,
            delivered: AtomicU64::new(0),
        })
    }

    /// Hub that also hands every packet back to its sender
    pub fn with_echo() -> Arc<Self> {
        Arc::new(Self {
            members: RwLock::new(Vec::new()),
            echo: true,
            delivered: AtomicU64::new(0),
        })
    }

    /// Register a participant and get its transport
    pub fn join(self: &Arc<Self>, id: SpeakerId, handler: ReceiveHandler) -> MemoryTransport {
        let mut members = self.members.write();
        members.retain(|(member, _)| *member != id);
        members.push((id.clone(), handler));
        tracing::debug!("{} joined memory hub ({} members)", id, members.len());

        MemoryTransport {
            id,
            hub: Arc::clone(self),
            connected: AtomicBool::new(true),
        }
    }

    /// Remove a participant; its transport keeps working but nobody hears it
    pub fn leave(&self, id: &SpeakerId) {
        self.members.write().retain(|(member, _)| member != id);
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    /// Total handler invocations so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn broadcast(&self, from: &SpeakerId, payload: Bytes) {
        // Snapshot so handlers run without the lock held
        let targets: Vec<ReceiveHandler> = self
            .members
            .read()
            .iter()
            .filter(|(member, _)| self.echo || member != from)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in targets {
            handler(from.clone(), payload.clone());
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// One participant's handle on a [`MemoryHub`]
pub struct MemoryTransport {
    id: SpeakerId,
    hub: Arc<MemoryHub>,
    connected: AtomicBool,
}

impl MemoryTransport {
    /// Simulate losing or regaining the connection
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, payload: Bytes) -> Result<(), NetworkError> {
        if !self.is_connected() {
            return Err(NetworkError::Disconnected);
        }
        self.hub.broadcast(&self.id, payload);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn local_id(&self) -> &SpeakerId {
        &self.id
    }

    fn shutdown(&self) {
        self.hub.leave(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (ReceiveHandler, Arc<Mutex<Vec<(SpeakerId, Bytes)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let handler: ReceiveHandler = Arc::new(move |id, bytes| sink.lock().push((id, bytes)));
        (handler, log)
    }

    #[test]
    fn test_send_reaches_others_only() {
        let hub = MemoryHub::new();
        let (alice_rx, alice_log) = recorder();
        let (bob_rx, bob_log) = recorder();
        let alice = hub.join(SpeakerId::from("alice"), alice_rx);
        let _bob = hub.join(SpeakerId::from("bob"), bob_rx);

        alice.send(Bytes::from_static(b"hi")).unwrap();

        assert!(alice_log.lock().is_empty());
        let bob_log = bob_log.lock();
        assert_eq!(bob_log.len(), 1);
        assert_eq!(bob_log[0].0, SpeakerId::from("alice"));
        assert_eq!(&bob_log[0].1[..], b"hi");
    }

    #[test]
    fn test_echo_hub_returns_to_sender() {
        let hub = MemoryHub::with_echo();
        let (rx, log) = recorder();
        let me = hub.join(SpeakerId::from("me"), rx);

        me.send(Bytes::from_static(b"x")).unwrap();
        assert_eq!(log.lock().len(), 1);
        assert_eq!(hub.delivered(), 1);
    }

    #[test]
    fn test_disconnected_send_fails() {
        let hub = MemoryHub::new();
        let (rx, _) = recorder();
        let (other_rx, other_log) = recorder();
        let me = hub.join(SpeakerId::from("me"), rx);
        let _other = hub.join(SpeakerId::from("other"), other_rx);

        me.set_connected(false);
        assert!(!me.is_connected());
        assert!(matches!(
            me.send(Bytes::from_static(b"x")),
            Err(NetworkError::Disconnected)
        ));
        assert!(other_log.lock().is_empty());

        me.set_connected(true);
        me.send(Bytes::from_static(b"x")).unwrap();
        assert_eq!(other_log.lock().len(), 1);
    }

    #[test]
    fn test_leave_stops_delivery() {
        let hub = MemoryHub::new();
        let (rx, _) = recorder();
        let (other_rx, other_log) = recorder();
        let me = hub.join(SpeakerId::from("me"), rx);
        let _other = hub.join(SpeakerId::from("other"), other_rx);

        hub.leave(&SpeakerId::from("other"));
        assert_eq!(hub.member_count(), 1);
        me.send(Bytes::from_static(b"x")).unwrap();
        assert!(other_log.lock().is_empty());

        me.shutdown();
        assert_eq!(hub.member_count(), 0);
    }
}
