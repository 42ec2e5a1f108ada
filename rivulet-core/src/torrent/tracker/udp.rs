//! UDP tracker client (BEP 15)
//!
//! Each announce is a connect exchange followed by an announce exchange on
//! a socket bound to the tracker's address. Replies whose transaction id
//! does not match the outstanding request are ignored.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::peer_list::{decode_compact_v4, decode_compact_v6};
use super::types::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};
use crate::torrent::TorrentError;

/// Magic constant opening every connect request.
pub const PROTOCOL_ID: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const DEFAULT_PORT: u16 = 6969;
const MAX_ATTEMPTS: usize = 3;
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DATAGRAM: usize = 2048;

/// Why one exchange attempt produced nothing usable.
enum AttemptFailure {
    TimedOut,
    Rejected(String),
    Io(std::io::Error),
}

/// UDP tracker client for `udp://host:port` URLs.
pub struct UdpTrackerClient {
    announce_url: String,
    host: String,
    port: u16,
    attempt_timeout: Duration,
}

impl UdpTrackerClient {
    /// Creates a client for a `udp://` URL. A missing port defaults to 6969.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UrlParsing` - Malformed URL
    /// - `TorrentError::UnsupportedTracker` - Not a `udp://` URL or no host
    pub fn new(announce_url: String) -> Result<Self, TorrentError> {
        let parsed = url::Url::parse(&announce_url)?;
        let host = match (parsed.scheme(), parsed.host_str()) {
            ("udp", Some(host)) => host.trim_matches(['[', ']']).to_string(),
            _ => return Err(TorrentError::UnsupportedTracker { url: announce_url }),
        };
        let port = parsed.port().unwrap_or(DEFAULT_PORT);

        Ok(Self {
            announce_url,
            host,
            port,
            attempt_timeout: ATTEMPT_TIMEOUT,
        })
    }

    /// Overrides the per-exchange timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    async fn open_socket(&self) -> Result<UdpSocket, TorrentError> {
        let target = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            })?;

        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        Ok(socket)
    }

    async fn attempt(
        &self,
        socket: &UdpSocket,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, AttemptFailure> {
        let transaction_id: u32 = rand::random();
        let mut connect = BytesMut::with_capacity(16);
        connect.put_u64(PROTOCOL_ID);
        connect.put_u32(ACTION_CONNECT);
        connect.put_u32(transaction_id);

        let mut reply = self.exchange(socket, &connect, transaction_id, 16).await?;
        let action = reply.get_u32();
        reply.advance(4);
        if action != ACTION_CONNECT {
            return Err(AttemptFailure::Rejected(format!(
                "unexpected action {action} in connect reply"
            )));
        }
        let connection_id = reply.get_u64();

        let transaction_id: u32 = rand::random();
        let mut announce = BytesMut::with_capacity(98);
        announce.put_u64(connection_id);
        announce.put_u32(ACTION_ANNOUNCE);
        announce.put_u32(transaction_id);
        announce.put_slice(request.info_hash.as_bytes());
        announce.put_slice(request.peer_id.as_bytes());
        announce.put_u64(request.downloaded);
        announce.put_u64(request.left);
        announce.put_u64(request.uploaded);
        announce.put_u32(AnnounceEvent::udp_code(request.event));
        announce.put_u32(0); // ip: sender address
        announce.put_u32(rand::random()); // key
        announce.put_i32(-1); // num_want: tracker default
        announce.put_u16(request.port);

        let mut reply = self.exchange(socket, &announce, transaction_id, 20).await?;
        let action = reply.get_u32();
        reply.advance(4);
        if action != ACTION_ANNOUNCE {
            return Err(AttemptFailure::Rejected(format!(
                "unexpected action {action} in announce reply"
            )));
        }

        let interval = reply.get_u32();
        let incomplete = reply.get_u32();
        let complete = reply.get_u32();

        let ipv4 = socket.peer_addr().map_err(AttemptFailure::Io)?.is_ipv4();
        let record = if ipv4 { 6 } else { 18 };
        let whole = &reply[..reply.len() - reply.len() % record];
        let decoded = if ipv4 {
            decode_compact_v4(whole)
        } else {
            decode_compact_v6(whole)
        };
        let peers = decoded.map_err(|e| AttemptFailure::Rejected(e.to_string()))?;

        Ok(AnnounceResponse {
            peers,
            interval: Some(interval),
            min_interval: None,
            complete: Some(complete),
            incomplete: Some(incomplete),
        })
    }

    /// Sends `packet` and waits for a reply carrying `transaction_id`.
    ///
    /// Returns the full datagram. Error replies (action 3) become
    /// `Rejected`; short or foreign datagrams are skipped.
    async fn exchange(
        &self,
        socket: &UdpSocket,
        packet: &[u8],
        transaction_id: u32,
        min_len: usize,
    ) -> Result<bytes::Bytes, AttemptFailure> {
        socket.send(packet).await.map_err(AttemptFailure::Io)?;

        let deadline = Instant::now() + self.attempt_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                Err(_) => return Err(AttemptFailure::TimedOut),
                Ok(Err(e)) => return Err(AttemptFailure::Io(e)),
                Ok(Ok(len)) => len,
            };
            if len < 8 {
                continue;
            }

            let mut datagram = bytes::Bytes::copy_from_slice(&buf[..len]);
            let action = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            let reply_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            if reply_id != transaction_id {
                tracing::trace!(tracker = %self.announce_url, "Ignoring reply for another transaction");
                continue;
            }
            if action == ACTION_ERROR {
                datagram.advance(8);
                return Err(AttemptFailure::Rejected(
                    String::from_utf8_lossy(&datagram).into_owned(),
                ));
            }
            if len < min_len {
                continue;
            }
            return Ok(datagram);
        }
    }
}

#[async_trait]
impl TrackerClient for UdpTrackerClient {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        tracing::debug!(tracker = %self.announce_url, event = ?request.event, "Announcing");
        let socket = self.open_socket().await?;

        let mut timed_out = false;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(&socket, request).await {
                Ok(response) => {
                    tracing::debug!(
                        tracker = %self.announce_url,
                        peers = response.peers.len(),
                        interval = ?response.interval,
                        "Announce succeeded"
                    );
                    return Ok(response);
                }
                Err(AttemptFailure::Rejected(reason)) => {
                    return Err(TorrentError::TrackerRejected {
                        url: self.announce_url.clone(),
                        reason,
                    });
                }
                Err(AttemptFailure::TimedOut) => {
                    tracing::debug!(tracker = %self.announce_url, attempt, "UDP announce timed out");
                    timed_out = true;
                }
                Err(AttemptFailure::Io(e)) => {
                    tracing::debug!(tracker = %self.announce_url, attempt, error = %e, "UDP announce failed");
                    timed_out = false;
                }
            }
        }

        let url = self.announce_url.clone();
        Err(if timed_out {
            TorrentError::TrackerTimeout { url }
        } else {
            TorrentError::TrackerConnectionFailed { url }
        })
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::torrent::{InfoHash, PeerId};

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([0xAA; 20]),
            peer_id: PeerId::new([0xBB; 20]),
            port: 7000,
            uploaded: 3,
            downloaded: 0,
            left: 100,
            event: Some(AnnounceEvent::Started),
        }
    }

    /// Answers connect and announce requests like a well-behaved tracker,
    /// preceding each real reply with one carrying a wrong transaction id.
    async fn fake_tracker(socket: UdpSocket, announces: Arc<AtomicUsize>) {
        let connection_id = 0x1122_3344_5566_7788u64;
        let mut buf = [0u8; 256];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let mut packet = &buf[..len];
            let head = packet.get_u64();
            let action = packet.get_u32();
            let tx = packet.get_u32();

            let mut decoy = BytesMut::new();
            decoy.put_u32(action);
            decoy.put_u32(tx.wrapping_add(1));
            decoy.put_slice(&[0u8; 12]);
            socket.send_to(&decoy, from).await.unwrap();

            let mut reply = BytesMut::new();
            if action == ACTION_CONNECT {
                assert_eq!(head, PROTOCOL_ID);
                reply.put_u32(ACTION_CONNECT);
                reply.put_u32(tx);
                reply.put_u64(connection_id);
            } else {
                assert_eq!(head, connection_id);
                assert_eq!(&packet[..20], &[0xAA; 20]);
                assert_eq!(&packet[20..40], &[0xBB; 20]);
                let mut fields = &packet[40..];
                assert_eq!(fields.get_u64(), 0); // downloaded
                assert_eq!(fields.get_u64(), 100); // left
                assert_eq!(fields.get_u64(), 3); // uploaded
                assert_eq!(fields.get_u32(), 2); // started
                fields.advance(8);
                assert_eq!(fields.get_i32(), -1);
                assert_eq!(fields.get_u16(), 7000);
                announces.fetch_add(1, Ordering::SeqCst);

                reply.put_u32(ACTION_ANNOUNCE);
                reply.put_u32(tx);
                reply.put_u32(900);
                reply.put_u32(4);
                reply.put_u32(7);
                reply.put_slice(&[10, 0, 0, 9, 0x1a, 0xe1]);
            }
            socket.send_to(&reply, from).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_udp_announce() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let announces = Arc::new(AtomicUsize::new(0));
        tokio::spawn(fake_tracker(socket, announces.clone()));

        let client = UdpTrackerClient::new(format!("udp://{addr}/announce")).unwrap();
        let response = client.announce(&request()).await.unwrap();

        assert_eq!(response.interval, Some(900));
        assert_eq!(response.incomplete, Some(4));
        assert_eq!(response.complete, Some(7));
        assert_eq!(response.peers, vec!["10.0.0.9:6881".parse().unwrap()]);
        assert_eq!(announces.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_udp_error_reply() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            let tx = &buf[12..16.min(len)];
            let mut reply = BytesMut::new();
            reply.put_u32(ACTION_ERROR);
            reply.put_slice(tx);
            reply.put_slice(b"torrent unknown");
            socket.send_to(&reply, from).await.unwrap();
        });

        let client = UdpTrackerClient::new(format!("udp://{addr}")).unwrap();
        let result = client.announce(&request()).await;
        assert!(matches!(
            result,
            Err(TorrentError::TrackerRejected { reason, .. }) if reason == "torrent unknown"
        ));
    }

    #[tokio::test]
    async fn test_udp_silent_tracker_times_out_after_retries() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while socket.recv_from(&mut buf).await.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let client = UdpTrackerClient::new(format!("udp://{addr}"))
            .unwrap()
            .with_attempt_timeout(Duration::from_millis(50));
        let result = client.announce(&request()).await;

        assert!(matches!(result, Err(TorrentError::TrackerTimeout { .. })));
        assert_eq!(received.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[test]
    fn test_url_validation() {
        let client = UdpTrackerClient::new("udp://tracker.example.org".to_string()).unwrap();
        assert_eq!(client.port, DEFAULT_PORT);
        assert!(matches!(
            UdpTrackerClient::new("http://tracker.example.org".to_string()),
            Err(TorrentError::UnsupportedTracker { .. })
        ));
    }
}
