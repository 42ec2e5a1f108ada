//! Rivulet Core - BitTorrent download and seeding engine
//!
//! This crate provides the building blocks of a single-torrent BitTorrent
//! client: descriptor parsing, tracker announces, the peer wire protocol,
//! the piece/block assembly engine, and on-disk output with resumption.

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::RivuletConfig;
pub use storage::StorageError;
pub use torrent::{TorrentError, TorrentSession};

/// Core errors that can bubble up from any Rivulet subsystem.
///
/// High-level error types representing failures in core functionality.
#[derive(Debug, thiserror::Error)]
pub enum RivuletError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RivuletError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            RivuletError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::TrackerConnectionFailed { url } => {
                    format!("Could not connect to tracker: {url}")
                }
                TorrentError::TrackerTimeout { url } => format!("Tracker did not answer: {url}"),
                TorrentError::TrackerRejected { reason, .. } => {
                    format!("Tracker refused the torrent: {reason}")
                }
                TorrentError::Storage(_) => "Output files could not be prepared".to_string(),
                _ => "Download error occurred".to_string(),
            },
            RivuletError::Storage(_) => "Storage error occurred".to_string(),
            RivuletError::Configuration { reason } => format!("Configuration error: {reason}"),
            RivuletError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            RivuletError::Configuration { .. }
                | RivuletError::Torrent(TorrentError::InvalidTorrentFile { .. })
        )
    }
}
