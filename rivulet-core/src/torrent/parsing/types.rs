//! Parsed torrent descriptor types

use std::path::Path;

use async_trait::async_trait;

use super::super::{InfoHash, TorrentError};

/// Everything the client needs from a `.torrent` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    /// SHA-1 over the raw bytes of the `info` dictionary
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    /// Sum of all file lengths
    pub total_length: u64,
    /// Files in stream order; multi-file paths start with `name`
    pub files: Vec<TorrentFile>,
    /// Tracker URLs, `announce` first, then `announce-list` tiers, deduplicated
    pub announce_urls: Vec<String>,
}

impl TorrentMetadata {
    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }
}

/// One file of the torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components relative to the output directory
    pub path: Vec<String>,
    pub length: u64,
}

/// Torrent descriptor parsing.
#[async_trait]
pub trait TorrentParser: Send + Sync {
    /// Parses bencoded descriptor bytes.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode, missing
    ///   fields, or inconsistent piece geometry
    async fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentMetadata, TorrentError>;

    /// Reads and parses a `.torrent` file.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - If the file cannot be read
    /// - `TorrentError::InvalidTorrentFile` - See [`parse_torrent_data`](Self::parse_torrent_data)
    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError>;
}
