//! One torrent's download session.
//!
//! Owns the active-connection set and the background tasks: disk writer,
//! stale-request sweep, tracker announces, and the inbound listener (driven
//! from the main loop). Shutdown stops new work, closes every connection,
//! then lets the writer drain so verified pieces reach disk.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::block_store::BlockStore;
use super::choking::{AlwaysUnchoke, ChokePolicy};
use super::parsing::TorrentMetadata;
use super::peer_connection::{ConnectionDirection, PeerConnection, PeerContext};
use super::protocol::PeerId;
use super::registry::ConnectionRegistry;
use super::scheduler::run_request_sweeper;
use super::stats::SessionStats;
use super::tracker::{AnnounceEvent, AnnounceRequest, TrackerClient, tracker_for_url};
use super::{InfoHash, TorrentError};
use crate::config::RivuletConfig;
use crate::storage::{DiskWriter, TorrentLayout, WriterReport};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Final state of a session run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub total_pieces: u32,
    pub completed_pieces: u32,
    /// Payload bytes received from peers this session
    pub downloaded: u64,
    /// Payload bytes sent to peers this session
    pub uploaded: u64,
    pub writer: WriterReport,
}

impl SessionSummary {
    pub fn is_complete(&self) -> bool {
        self.completed_pieces == self.total_pieces
    }
}

/// Download session for a single torrent.
pub struct TorrentSession {
    metadata: TorrentMetadata,
    config: RivuletConfig,
    peer_id: PeerId,
    store: Arc<BlockStore>,
    writer: Option<DiskWriter>,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<SessionStats>,
    choke_policy: Arc<dyn ChokePolicy>,
    trackers: Vec<Box<dyn TrackerClient>>,
    initial_peers: Vec<SocketAddr>,
    listener: Option<TcpListener>,
}

impl TorrentSession {
    /// Prepares output files and replays the resume log.
    ///
    /// Tracker URLs with an unsupported scheme are skipped with a warning.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - Invalid layout, or output files or the
    ///   resume log cannot be created
    /// - `TorrentError::Io` - Resume directory cannot be created
    pub fn new(metadata: TorrentMetadata, config: RivuletConfig) -> Result<Self, TorrentError> {
        let layout = Arc::new(TorrentLayout::from_metadata(&metadata)?);

        let resume_dir = config.storage.resume_dir();
        std::fs::create_dir_all(resume_dir)?;
        let resume_path = resume_path(resume_dir.to_path_buf(), metadata.info_hash);

        let registry = Arc::new(ConnectionRegistry::new());
        let (store, writer) = BlockStore::init(
            layout,
            &config.storage.output_dir,
            &resume_path,
            Arc::clone(&registry),
        )?;

        let trackers = metadata
            .announce_urls
            .iter()
            .filter_map(|url| match tracker_for_url(url, &config.network) {
                Ok(tracker) => Some(tracker),
                Err(e) => {
                    warn!(tracker = %url, error = %e, "Skipping tracker");
                    None
                }
            })
            .collect();

        let peer_id = PeerId::generate(config.torrent.client_id);
        info!(
            name = %metadata.name,
            info_hash = %metadata.info_hash,
            %peer_id,
            resume = %resume_path.display(),
            "Session created"
        );

        Ok(Self {
            metadata,
            config,
            peer_id,
            store,
            writer: Some(writer),
            registry,
            stats: Arc::new(SessionStats::new()),
            choke_policy: Arc::new(AlwaysUnchoke),
            trackers,
            initial_peers: Vec::new(),
            listener: None,
        })
    }

    /// Adds peers to dial at startup, in addition to tracker results.
    pub fn with_peers(mut self, peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.initial_peers.extend(peers);
        self
    }

    /// Replaces the baseline [`AlwaysUnchoke`] policy.
    pub fn with_choke_policy(mut self, policy: Arc<dyn ChokePolicy>) -> Self {
        self.choke_policy = policy;
        self
    }

    /// Replaces the trackers derived from the descriptor.
    pub fn with_trackers(mut self, trackers: Vec<Box<dyn TrackerClient>>) -> Self {
        self.trackers = trackers;
        self
    }

    /// Binds the inbound listener now rather than at the start of
    /// [`run`](Self::run), returning the bound address.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - If the port cannot be bound
    pub async fn bind_listener(&mut self) -> Result<SocketAddr, TorrentError> {
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr()?);
        }
        let listener =
            TcpListener::bind(("0.0.0.0", self.config.network.listen_port)).await?;
        let address = listener.local_addr()?;
        info!(%address, "Listening for peers");
        self.listener = Some(listener);
        Ok(address)
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn info_hash(&self) -> InfoHash {
        self.metadata.info_hash
    }

    /// Runs until `shutdown` flips to true or, unless seeding is enabled,
    /// until every piece is verified.
    ///
    /// Returns immediately when the resume log already covers the whole
    /// torrent and seeding is disabled.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - If the listener cannot be bound
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionSummary, TorrentError> {
        let seeding = self.config.torrent.seed_after_complete;
        if self.store.is_download_complete() && !seeding {
            info!(name = %self.metadata.name, "Already complete, nothing to download");
            return Ok(self.summary(WriterReport::default()));
        }

        let listen_addr = self.bind_listener().await?;
        let Some(listener) = self.listener.take() else {
            return Err(TorrentError::PeerConnectionError {
                reason: "listener unavailable".to_string(),
            });
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let (writer_stop_tx, writer_stop_rx) = watch::channel(false);
        let (complete_tx, complete_rx) = watch::channel(self.store.is_download_complete());
        let (peers_tx, mut peers_rx) = mpsc::unbounded_channel::<Vec<SocketAddr>>();

        let Some(writer) = self.writer.take() else {
            return Err(TorrentError::PeerConnectionError {
                reason: "disk writer already taken".to_string(),
            });
        };
        let writer_task = tokio::spawn(writer.run(writer_stop_rx));
        let sweeper_task = tokio::spawn(run_request_sweeper(
            Arc::clone(&self.store),
            self.config.torrent.sweep_interval,
            self.config.torrent.request_timeout,
            stop_rx.clone(),
        ));
        let announcer = Announcer {
            trackers: std::mem::take(&mut self.trackers),
            info_hash: self.metadata.info_hash,
            peer_id: self.peer_id,
            port: listen_addr.port(),
            store: Arc::clone(&self.store),
            stats: Arc::clone(&self.stats),
            min_interval: self.config.network.min_announce_interval,
            stopped_timeout: self.config.network.tracker_timeout,
        };
        let announce_task = tokio::spawn(announcer.run(peers_tx, complete_rx, stop_rx.clone()));

        let mut connections: HashMap<SocketAddr, JoinHandle<()>> = HashMap::new();
        let initial = std::mem::take(&mut self.initial_peers);
        self.connect_to(&mut connections, initial, &stop_rx);

        let mut status = tokio::time::interval(STATUS_INTERVAL);
        status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_completed = self.store.completed_count();
        let mut announced_complete = self.store.is_download_complete();

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, address)) => self.accept(&mut connections, stream, address, &stop_rx),
                    Err(e) => warn!(error = %e, "Failed to accept peer connection"),
                },
                Some(peers) = peers_rx.recv() => {
                    self.connect_to(&mut connections, peers, &stop_rx);
                }
                _ = status.tick() => {
                    connections.retain(|_, task| !task.is_finished());
                    let completed = self.store.completed_count();
                    if completed != last_completed {
                        last_completed = completed;
                        self.log_progress(completed);
                    }

                    if self.store.is_download_complete() && !announced_complete {
                        announced_complete = true;
                        info!(name = %self.metadata.name, "Download complete");
                        let _ = complete_tx.send(true);
                        if !seeding {
                            break;
                        }
                    }
                }
            }
        }

        drop(listener);
        let _ = stop_tx.send(true);

        let open = connections.len();
        for joined in futures::future::join_all(connections.into_values()).await {
            if let Err(e) = joined {
                warn!(error = %e, "Connection task failed");
            }
        }
        debug!(connections = open, "All connections closed");

        if let Err(e) = announce_task.await {
            warn!(error = %e, "Announce task failed");
        }
        if let Err(e) = sweeper_task.await {
            warn!(error = %e, "Sweep task failed");
        }

        let _ = writer_stop_tx.send(true);
        let report = match writer_task.await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Disk writer task failed");
                WriterReport::default()
            }
        };

        let summary = self.summary(report);
        info!(
            completed = summary.completed_pieces,
            total = summary.total_pieces,
            downloaded = summary.downloaded,
            uploaded = summary.uploaded,
            written = report.written,
            "Session finished"
        );
        Ok(summary)
    }

    fn peer_context(&self) -> PeerContext {
        PeerContext {
            info_hash: self.metadata.info_hash,
            peer_id: self.peer_id,
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            choke_policy: Arc::clone(&self.choke_policy),
            stats: Arc::clone(&self.stats),
            config: self.config.torrent.clone(),
            max_frame_length: self.config.network.max_frame_length,
        }
    }

    fn has_capacity(&self, connections: &mut HashMap<SocketAddr, JoinHandle<()>>) -> bool {
        connections.retain(|_, task| !task.is_finished());
        connections.len() < self.config.network.max_peer_connections
    }

    fn connect_to(
        &self,
        connections: &mut HashMap<SocketAddr, JoinHandle<()>>,
        peers: Vec<SocketAddr>,
        stop: &watch::Receiver<bool>,
    ) {
        for address in peers {
            if connections.contains_key(&address) {
                continue;
            }
            if !self.has_capacity(connections) {
                debug!(peer = %address, "Connection limit reached, skipping peer");
                break;
            }

            let connection = PeerConnection::new(
                address,
                ConnectionDirection::Outbound,
                self.peer_context(),
            );
            let connect_timeout = self.config.network.connect_timeout;
            let stop = stop.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = connection.connect_outbound(connect_timeout, stop).await {
                    debug!(peer = %address, error = %e, "Outbound connection ended");
                }
            });
            connections.insert(address, task);
        }
    }

    fn accept(
        &self,
        connections: &mut HashMap<SocketAddr, JoinHandle<()>>,
        stream: TcpStream,
        address: SocketAddr,
        stop: &watch::Receiver<bool>,
    ) {
        if connections.contains_key(&address) || !self.has_capacity(connections) {
            debug!(peer = %address, "Refusing inbound connection");
            return;
        }

        let _ = stream.set_nodelay(true);
        let connection =
            PeerConnection::new(address, ConnectionDirection::Inbound, self.peer_context());
        let stop = stop.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = connection.run(stream, stop).await {
                debug!(peer = %address, error = %e, "Inbound connection ended");
            }
        });
        connections.insert(address, task);
    }

    fn log_progress(&self, completed: u32) {
        let total = self.store.layout().num_pieces();
        info!(
            pieces = completed,
            total,
            progress = format!("{:.2}%", f64::from(completed) * 100.0 / f64::from(total)),
            peers = self.stats.connected_peers(),
            downloaded = self.stats.downloaded(),
            uploaded = self.stats.uploaded(),
            "Progress"
        );
    }

    fn summary(&self, writer: WriterReport) -> SessionSummary {
        SessionSummary {
            total_pieces: self.store.layout().num_pieces(),
            completed_pieces: self.store.completed_count(),
            downloaded: self.stats.downloaded(),
            uploaded: self.stats.uploaded(),
            writer,
        }
    }
}

/// Resume log location for a torrent: `<dir>/<info hash>.resume`.
pub fn resume_path(dir: PathBuf, info_hash: InfoHash) -> PathBuf {
    dir.join(format!("{info_hash}.resume"))
}

/// Announces to every tracker and forwards the returned peers.
struct Announcer {
    trackers: Vec<Box<dyn TrackerClient>>,
    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,
    store: Arc<BlockStore>,
    stats: Arc<SessionStats>,
    min_interval: Duration,
    stopped_timeout: Duration,
}

impl Announcer {
    async fn run(
        self,
        peers_tx: mpsc::UnboundedSender<Vec<SocketAddr>>,
        mut complete: watch::Receiver<bool>,
        mut stop: watch::Receiver<bool>,
    ) {
        if self.trackers.is_empty() {
            debug!("No trackers, announcing disabled");
            return;
        }

        let mut event = Some(AnnounceEvent::Started);
        loop {
            let interval = tokio::select! {
                interval = self.announce_all(event.take(), &peers_tx) => interval,
                _ = stop.wait_for(|stop| *stop) => break,
            };
            debug!(next_in = ?interval, "Announce round finished");

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = complete.changed() => {
                    if changed.is_ok() && *complete.borrow_and_update() {
                        event = Some(AnnounceEvent::Completed);
                    }
                }
                _ = stop.wait_for(|stop| *stop) => break,
            }
        }

        // Best effort; the tracker forgets us eventually anyway.
        let stopped = tokio::time::timeout(
            self.stopped_timeout,
            self.announce_all(Some(AnnounceEvent::Stopped), &peers_tx),
        )
        .await;
        if stopped.is_err() {
            debug!("Stopped announce timed out");
        }
    }

    /// Announces once to every tracker and returns the delay before the
    /// next round: the shortest tracker interval, never below the minimum.
    async fn announce_all(
        &self,
        event: Option<AnnounceEvent>,
        peers_tx: &mpsc::UnboundedSender<Vec<SocketAddr>>,
    ) -> Duration {
        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: self.stats.uploaded(),
            downloaded: self.stats.downloaded(),
            left: self.store.bytes_left(),
            event,
        };

        let mut next: Option<Duration> = None;
        for tracker in &self.trackers {
            match tracker.announce(&request).await {
                Ok(response) => {
                    info!(
                        tracker = tracker.tracker_url(),
                        peers = response.peers.len(),
                        seeders = ?response.complete,
                        leechers = ?response.incomplete,
                        "Tracker responded"
                    );
                    if let Some(seconds) = response.interval.or(response.min_interval) {
                        let interval = Duration::from_secs(u64::from(seconds));
                        next = Some(next.map_or(interval, |current| current.min(interval)));
                    }
                    if !response.peers.is_empty() {
                        let _ = peers_tx.send(response.peers);
                    }
                }
                Err(e) => warn!(tracker = tracker.tracker_url(), error = %e, "Announce failed"),
            }
        }

        next.unwrap_or(self.min_interval).max(self.min_interval)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use sha1::{Digest, Sha1};
    use tempfile::TempDir;

    use super::*;
    use crate::torrent::parsing::TorrentFile;
    use crate::torrent::tracker::AnnounceResponse;

    fn metadata(content: &[u8], piece_length: u32) -> TorrentMetadata {
        let piece_hashes: Vec<[u8; 20]> = content
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        let info_hash = InfoHash::new(Sha1::digest(b"session test").into());
        TorrentMetadata {
            info_hash,
            name: "sample.bin".to_string(),
            piece_length,
            piece_hashes,
            total_length: content.len() as u64,
            files: vec![TorrentFile {
                path: vec!["sample.bin".to_string()],
                length: content.len() as u64,
            }],
            announce_urls: Vec::new(),
        }
    }

    fn config(dir: &TempDir) -> RivuletConfig {
        let mut config = RivuletConfig::for_testing();
        config.storage.output_dir = dir.path().join("out");
        config.storage.resume_dir = Some(dir.path().join("state"));
        config
    }

    /// Records every announce and hands back a fixed peer list.
    struct RecordingTracker {
        events: Arc<Mutex<Vec<Option<AnnounceEvent>>>>,
        calls: Arc<AtomicUsize>,
        peers: Vec<SocketAddr>,
    }

    #[async_trait]
    impl TrackerClient for RecordingTracker {
        async fn announce(
            &self,
            request: &AnnounceRequest,
        ) -> Result<AnnounceResponse, TorrentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.events.lock().push(request.event);
            Ok(AnnounceResponse {
                peers: self.peers.clone(),
                interval: Some(1),
                ..Default::default()
            })
        }

        fn tracker_url(&self) -> &str {
            "test://recording"
        }
    }

    #[test]
    fn test_resume_path_uses_info_hash() {
        let hash = InfoHash::new([0xAB; 20]);
        let path = resume_path(PathBuf::from("/state"), hash);
        assert_eq!(path, PathBuf::from(format!("/state/{}.resume", "ab".repeat(20))));
    }

    #[tokio::test]
    async fn test_unsupported_trackers_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut meta = metadata(&[1u8; 100], 64);
        meta.announce_urls = vec![
            "wss://tracker.example/announce".to_string(),
            "http://tracker.example/announce".to_string(),
        ];
        let session = TorrentSession::new(meta, config(&dir)).unwrap();
        assert_eq!(session.trackers.len(), 1);
    }

    #[tokio::test]
    async fn test_already_complete_returns_without_network() {
        let dir = TempDir::new().unwrap();
        let content = vec![5u8; 100];
        let meta = metadata(&content, 64);
        let config = config(&dir);

        let resume = resume_path(config.storage.resume_dir().to_path_buf(), meta.info_hash);
        std::fs::create_dir_all(resume.parent().unwrap()).unwrap();
        let mut records = Vec::new();
        records.extend_from_slice(&0u32.to_ne_bytes());
        records.extend_from_slice(&1u32.to_ne_bytes());
        std::fs::write(&resume, records).unwrap();

        let session = TorrentSession::new(meta, config).unwrap();
        let (_tx, rx) = watch::channel(false);
        let summary = tokio::time::timeout(Duration::from_secs(1), session.run(rx))
            .await
            .unwrap()
            .unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.downloaded, 0);
        assert_eq!(summary.writer, WriterReport::default());
    }

    #[tokio::test]
    async fn test_shutdown_sends_started_then_stopped() {
        let dir = TempDir::new().unwrap();
        let meta = metadata(&[9u8; 300], 128);
        let events = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let tracker = RecordingTracker {
            events: Arc::clone(&events),
            calls: Arc::clone(&calls),
            // Nobody listens here; the connection attempt just fails.
            peers: vec![SocketAddr::from(([127, 0, 0, 1], 1))],
        };

        let session = TorrentSession::new(meta, config(&dir))
            .unwrap()
            .with_trackers(vec![Box::new(tracker)]);
        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(session.run(rx));

        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(!summary.is_complete());
        let events = events.lock().clone();
        assert_eq!(events.first(), Some(&Some(AnnounceEvent::Started)));
        assert_eq!(events.last(), Some(&Some(AnnounceEvent::Stopped)));
    }
}
