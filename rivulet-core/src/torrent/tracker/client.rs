//! HTTP(S) tracker client with URL building and response parsing

use async_trait::async_trait;

use super::peer_list::{decode_compact_v6, decode_peer_list};
use super::types::{AnnounceRequest, AnnounceResponse, TrackerClient};
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// HTTP tracker client (BEP 3 announce over `http://` and `https://`).
pub struct HttpTrackerClient {
    pub(super) announce_url: String,
    pub(super) client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates a client using the configured timeout and user agent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Http` - If the HTTP client cannot be constructed
    pub fn new(announce_url: String, config: &NetworkConfig) -> Result<Self, TorrentError> {
        let client = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            announce_url,
            client,
        })
    }

    /// Builds the announce URL with query parameters.
    ///
    /// Binary fields are percent-encoded by hand so reqwest does not
    /// re-encode them.
    pub(super) fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let separator = if self.announce_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{separator}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.announce_url,
            url_encode_bytes(request.info_hash.as_bytes()),
            url_encode_bytes(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if let Some(event) = request.event {
            url.push_str("&event=");
            url.push_str(event.as_str());
        }
        url
    }

    /// Parses a bencoded announce response.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerRejected` - Response carries `failure reason`
    /// - `TorrentError::ProtocolError` - Malformed bencode or peer list
    pub(super) fn parse_announce_response(
        &self,
        response_bytes: &[u8],
    ) -> Result<AnnounceResponse, TorrentError> {
        let parsed = bencode_rs::Value::parse(response_bytes)
            .map_err(|e| TorrentError::protocol(format!("failed to parse tracker response: {e:?}")))?;

        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(TorrentError::protocol("tracker response is not a dictionary"));
        };

        if let Some(bencode_rs::Value::Bytes(reason)) = dict.get(b"failure reason".as_slice()) {
            return Err(TorrentError::TrackerRejected {
                url: self.announce_url.clone(),
                reason: String::from_utf8_lossy(reason).into_owned(),
            });
        }

        let integer = |key: &[u8]| match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => u32::try_from(*value).ok(),
            _ => None,
        };

        let mut peers = match dict.get(b"peers".as_slice()) {
            Some(value) => decode_peer_list(value)?,
            None => Vec::new(),
        };
        if let Some(bencode_rs::Value::Bytes(blob)) = dict.get(b"peers6".as_slice()) {
            peers.extend(decode_compact_v6(blob)?);
        }

        Ok(AnnounceResponse {
            peers,
            interval: integer(b"interval"),
            min_interval: integer(b"min interval"),
            complete: integer(b"complete"),
            incomplete: integer(b"incomplete"),
        })
    }
}

/// Percent-encodes every byte, as trackers expect for binary fields.
pub(crate) fn url_encode_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| format!("%{b:02X}")).collect()
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(request);
        tracing::debug!(tracker = %self.announce_url, event = ?request.event, "Announcing");

        let response = self.client.get(&url).send().await.map_err(|e| {
            tracing::warn!(tracker = %self.announce_url, error = %e, "HTTP announce failed");
            if e.is_timeout() {
                TorrentError::TrackerTimeout {
                    url: self.announce_url.clone(),
                }
            } else {
                TorrentError::TrackerConnectionFailed {
                    url: self.announce_url.clone(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(tracker = %self.announce_url, %status, "Tracker returned error status");
            return Err(TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            });
        }

        let body = response.bytes().await.map_err(|e| {
            tracing::warn!(tracker = %self.announce_url, error = %e, "Failed to read tracker response");
            TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            }
        })?;

        let parsed = self.parse_announce_response(&body)?;
        tracing::debug!(
            tracker = %self.announce_url,
            peers = parsed.peers.len(),
            interval = ?parsed.interval,
            "Announce succeeded"
        );
        Ok(parsed)
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}
