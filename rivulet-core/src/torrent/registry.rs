//! Live connection handles, referenced weakly.
//!
//! Each connection task owns the only strong `Arc<PeerHandle>`. Block
//! records and this registry hold `Weak` references, so a finished task
//! disappears from both without explicit deregistration.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::PieceIndex;
use super::protocol::PeerMessage;

/// Shared view of one connection: its address, its in-flight request
/// count, and a queue into its writer task.
#[derive(Debug)]
pub struct PeerHandle {
    address: SocketAddr,
    in_flight: AtomicUsize,
    outbound: mpsc::UnboundedSender<PeerMessage>,
}

impl PeerHandle {
    pub fn new(address: SocketAddr, outbound: mpsc::UnboundedSender<PeerMessage>) -> Self {
        Self {
            address,
            in_flight: AtomicUsize::new(0),
            outbound,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Outstanding block requests sent on this connection.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Counts one more outstanding request.
    pub fn reserve_slot(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one outstanding request, never going below zero.
    pub fn release_slot(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Queues a message for the writer task. Returns false once the
    /// connection has shut down.
    pub fn queue(&self, message: PeerMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

/// Weak set of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    handles: Mutex<Vec<Weak<PeerHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: &Arc<PeerHandle>) {
        self.handles.lock().push(Arc::downgrade(handle));
    }

    /// Queues `have` on every live connection, pruning dead ones.
    ///
    /// Delivery is best effort. Returns the number of connections reached.
    pub fn broadcast_have(&self, piece_index: PieceIndex) -> usize {
        let mut handles = self.handles.lock();
        let mut reached = 0;
        handles.retain(|weak| match weak.upgrade() {
            Some(handle) => {
                if handle.queue(PeerMessage::Have { piece_index }) {
                    reached += 1;
                } else {
                    trace!(peer = %handle.address(), piece = %piece_index, "Have not delivered");
                }
                true
            }
            None => false,
        });
        trace!(piece = %piece_index, reached, "Broadcast have");
        reached
    }

    /// Number of registered connections that are still alive.
    pub fn live_count(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Drops entries whose connection has ended.
    pub fn prune(&self) {
        self.handles.lock().retain(|weak| weak.strong_count() > 0);
    }
}
