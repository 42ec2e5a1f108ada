//! Transfer counters shared by all connections of a session.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Session-wide byte and peer counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    connected_peers: AtomicUsize,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn peer_connected(&self) {
        self.connected_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_disconnected(&self) {
        let _ = self
            .connected_peers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn connected_peers(&self) -> usize {
        self.connected_peers.load(Ordering::Relaxed)
    }
}
