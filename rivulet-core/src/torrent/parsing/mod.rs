//! Torrent descriptor parsing.
//!
//! Metadata extraction uses bencode-rs for decoding; the info hash is taken
//! over the exact bytes of the top-level `info` value.

pub mod bencode;
pub mod parser;
pub mod types;

pub use parser::BencodeTorrentParser;
pub use types::{TorrentFile, TorrentMetadata, TorrentParser};
