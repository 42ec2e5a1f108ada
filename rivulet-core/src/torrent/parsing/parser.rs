//! Torrent parser backed by bencode-rs

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::super::TorrentError;
use super::bencode::BencodeParser;
use super::types::{TorrentMetadata, TorrentParser};

/// Parses `.torrent` descriptors with bencode-rs.
#[derive(Debug, Default, Clone, Copy)]
pub struct BencodeTorrentParser;

impl BencodeTorrentParser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TorrentParser for BencodeTorrentParser {
    async fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        BencodeParser::parse_bencode_data(data)
    }

    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError> {
        let contents = tokio::fs::read(path).await?;
        let metadata = self.parse_torrent_data(&contents).await?;
        debug!(
            path = %path.display(),
            info_hash = %metadata.info_hash,
            pieces = metadata.num_pieces(),
            "Parsed torrent file"
        );
        Ok(metadata)
    }
}
