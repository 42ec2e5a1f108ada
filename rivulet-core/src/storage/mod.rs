//! Storage layer for torrent data.
//!
//! Maps the torrent's logical byte stream onto output files, persists
//! verified pieces through a background writer, and records completion in
//! an append-only resume log.

pub mod files;
pub mod layout;
pub mod resume;
pub mod writer;

use std::path::PathBuf;

pub use files::OutputFiles;
pub use layout::{BLOCK_SIZE, FileEntry, OutputFileSpan, SpanSlice, TorrentLayout, intersect_spans};
pub use resume::{ResumeLog, ResumeState};
pub use writer::{CompletedPiece, DiskWriter, WriterReport};

/// Errors that occur during storage operations.
///
/// Covers file system errors, invalid torrent geometry, and out-of-range
/// accesses against the logical byte stream.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Torrent geometry is inconsistent (lengths, hash count, file sizes)
    #[error("Invalid layout: {reason}")]
    InvalidLayout {
        /// Description of the inconsistency
        reason: String,
    },

    /// Byte range falls outside the logical stream
    #[error("Range {offset}+{length} exceeds stream of {total} bytes")]
    OutOfRange {
        /// Start offset in the logical stream
        offset: u64,
        /// Requested length
        length: u64,
        /// Total stream length
        total: u64,
    },

    /// An output file could not be created or sized
    #[error("Failed to prepare {path}: {source}")]
    FileCreation {
        /// Output file that failed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
