//! Announce request and response types shared by HTTP and UDP trackers

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::torrent::{InfoHash, PeerId, TorrentError};

/// Tracker announce request.
///
/// Reports transfer progress for one torrent and asks for peers.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// TCP port accepting peer connections
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes still missing (0 once complete)
    pub left: u64,
    /// `None` for periodic announces; `Started` first, `Completed` once on
    /// finishing, `Stopped` at shutdown
    pub event: Option<AnnounceEvent>,
}

/// Lifecycle events reported to trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    /// Query string value used by HTTP trackers.
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }

    /// Event code used by UDP trackers (0 means none).
    pub fn udp_code(event: Option<Self>) -> u32 {
        match event {
            None => 0,
            Some(AnnounceEvent::Completed) => 1,
            Some(AnnounceEvent::Started) => 2,
            Some(AnnounceEvent::Stopped) => 3,
        }
    }
}

/// Tracker announce response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub peers: Vec<SocketAddr>,
    /// Seconds until the next announce, when the tracker sent one
    pub interval: Option<u32>,
    pub min_interval: Option<u32>,
    /// Seeders in the swarm
    pub complete: Option<u32>,
    /// Leechers in the swarm
    pub incomplete: Option<u32>,
}

/// Tracker communication.
///
/// Implemented for HTTP(S) and UDP trackers so the session can announce to
/// every URL of a torrent through one interface.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announces progress and returns the tracker's peer list.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - Network failure or bad status
    /// - `TorrentError::TrackerTimeout` - No answer within the configured timeout
    /// - `TorrentError::TrackerRejected` - Tracker returned a failure reason
    /// - `TorrentError::ProtocolError` - Malformed response
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TorrentError>;

    /// URL this client announces to.
    fn tracker_url(&self) -> &str;
}
