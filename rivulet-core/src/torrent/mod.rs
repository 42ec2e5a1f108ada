//! BitTorrent protocol implementation: piece engine, peer wire protocol,
//! trackers, and the session that ties them together.

pub mod block_store;
pub mod choking;
pub mod parsing;
pub mod peer_connection;
pub mod peer_state;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod tracker;

use std::fmt;

pub use block_store::{BlockOutcome, BlockRequest, BlockStore};
pub use choking::{AlwaysUnchoke, ChokeDecision, ChokePolicy};
pub use parsing::{BencodeTorrentParser, TorrentFile, TorrentMetadata, TorrentParser};
pub use peer_connection::{ConnectionDirection, PeerConnection, PeerContext};
pub use peer_state::{PeerBitfield, PeerConnectionState};
pub use protocol::{ConnectionState, PeerHandshake, PeerId, PeerMessage};
pub use registry::{ConnectionRegistry, PeerHandle};
pub use scheduler::{LinearSelection, SelectionStrategy};
pub use session::{SessionSummary, TorrentSession};
pub use stats::SessionStats;
pub use tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, HttpTrackerClient, TrackerClient,
    UdpTrackerClient, tracker_for_url,
};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index for slice addressing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Covers descriptor parsing, tracker communication, the peer wire protocol,
/// and piece bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Tracker connection failed: {url}")]
    TrackerConnectionFailed { url: String },

    #[error("Tracker timed out: {url}")]
    TrackerTimeout { url: String },

    #[error("Tracker {url} rejected announce: {reason}")]
    TrackerRejected { url: String, reason: String },

    #[error("Unsupported tracker URL: {url}")]
    UnsupportedTracker { url: String },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}

impl TorrentError {
    /// Shorthand for wire-level protocol violations.
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
        }
    }
}
