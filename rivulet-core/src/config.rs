//! Centralized configuration for Rivulet.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Rivulet components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct RivuletConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

/// BitTorrent protocol-specific configuration.
///
/// Controls block requests, pipelining, and request timeout recovery.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// BitTorrent client identifier prefix for generated peer ids
    pub client_id: &'static str,
    /// Maximum number of outstanding block requests per peer
    pub pipeline_limit: usize,
    /// Age after which an unanswered block request is released
    pub request_timeout: Duration,
    /// Interval between stale request sweeps
    pub sweep_interval: Duration,
    /// Largest block a remote peer may request from us
    pub max_upload_request: u32,
    /// Keep serving peers after every piece is verified
    pub seed_after_complete: bool,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: "-RV0001-",
            pipeline_limit: 500,
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            max_upload_request: 128 * 1024,
            seed_after_complete: false,
        }
    }
}

/// Network communication and tracker configuration.
///
/// Controls the listening port, connection limits, and tracker
/// communication parameters.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP port accepting inbound peer connections
    pub listen_port: u16,
    /// Timeout for establishing outbound TCP connections
    pub connect_timeout: Duration,
    /// HTTP/UDP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// Lower bound applied to tracker-provided announce intervals
    pub min_announce_interval: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Maximum concurrent peer connections
    pub max_peer_connections: usize,
    /// Largest accepted wire frame (length prefix value)
    pub max_frame_length: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            connect_timeout: Duration::from_secs(5),
            tracker_timeout: Duration::from_secs(30),
            min_announce_interval: Duration::from_secs(180),
            user_agent: "rivulet/0.1.0",
            max_peer_connections: 50,
            max_frame_length: 2 * 1024 * 1024 + 9,
        }
    }
}

/// Output file and resumption configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory receiving the torrent's output files
    pub output_dir: PathBuf,
    /// Directory holding resume logs (defaults to the output directory)
    pub resume_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            resume_dir: None,
        }
    }
}

impl StorageConfig {
    /// Directory where resume logs are kept.
    pub fn resume_dir(&self) -> &std::path::Path {
        self.resume_dir.as_deref().unwrap_or(&self.output_dir)
    }
}

impl RivuletConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("RIVULET_LISTEN_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            config.network.listen_port = port;
        }

        if let Ok(max_peers) = std::env::var("RIVULET_MAX_PEERS")
            && let Ok(count) = max_peers.parse::<usize>()
        {
            config.network.max_peer_connections = count;
        }

        if let Ok(limit) = std::env::var("RIVULET_PIPELINE_LIMIT")
            && let Ok(limit) = limit.parse::<usize>()
        {
            config.torrent.pipeline_limit = limit.max(1);
        }

        if let Ok(timeout) = std::env::var("RIVULET_REQUEST_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.torrent.request_timeout = Duration::from_secs(seconds);
        }

        if let Ok(timeout) = std::env::var("RIVULET_TRACKER_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.network.tracker_timeout = Duration::from_secs(seconds);
        }

        config
    }

    /// Creates a configuration suited to loopback tests: ephemeral listen
    /// port, short timeouts, fast sweeps.
    pub fn for_testing() -> Self {
        Self {
            torrent: TorrentConfig {
                request_timeout: Duration::from_millis(500),
                sweep_interval: Duration::from_millis(50),
                ..Default::default()
            },
            network: NetworkConfig {
                listen_port: 0,
                connect_timeout: Duration::from_secs(2),
                tracker_timeout: Duration::from_secs(2),
                min_announce_interval: Duration::from_secs(1),
                ..Default::default()
            },
            storage: StorageConfig::default(),
        }
    }
}
