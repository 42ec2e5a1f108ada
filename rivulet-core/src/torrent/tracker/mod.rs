//! Tracker communication: HTTP(S) and UDP announce clients.
//!
//! Both clients return the same [`AnnounceResponse`]; [`tracker_for_url`]
//! picks the implementation from the URL scheme.

pub mod client;
pub mod peer_list;
pub mod types;
pub mod udp;

pub use client::HttpTrackerClient;
pub use peer_list::{decode_compact_v4, decode_compact_v6, decode_peer_list};
pub use types::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};
pub use udp::UdpTrackerClient;

use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// Builds the tracker client matching the scheme of `url`.
///
/// # Errors
///
/// - `TorrentError::UrlParsing` - Malformed URL
/// - `TorrentError::UnsupportedTracker` - Scheme is not http, https, or udp
/// - `TorrentError::Http` - HTTP client construction failed
pub fn tracker_for_url(
    url: &str,
    config: &NetworkConfig,
) -> Result<Box<dyn TrackerClient>, TorrentError> {
    let parsed = url::Url::parse(url)?;
    match parsed.scheme() {
        "http" | "https" => Ok(Box::new(HttpTrackerClient::new(url.to_string(), config)?)),
        "udp" => Ok(Box::new(
            UdpTrackerClient::new(url.to_string())?
                .with_attempt_timeout(config.tracker_timeout.min(std::time::Duration::from_secs(5))),
        )),
        _ => Err(TorrentError::UnsupportedTracker {
            url: url.to_string(),
        }),
    }
}
