//! Torrent geometry: piece sizes, block sizes, and file spans.
//!
//! Everything here is pure data computed once from the parsed metadata.
//! Routing a piece's bytes to output files goes through [`intersect_spans`].

use std::path::{Component, Path, PathBuf};

use super::StorageError;
use crate::torrent::{PieceIndex, TorrentMetadata};

/// Wire-level request unit. The final block of a piece may be shorter.
pub const BLOCK_SIZE: u32 = 16_384;

/// One output file as described by the torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the output directory
    pub relative_path: PathBuf,
    /// Length of the file in bytes
    pub length: u64,
}

/// Immutable geometry of a torrent's logical byte stream.
#[derive(Debug, Clone)]
pub struct TorrentLayout {
    total_length: u64,
    piece_length: u32,
    piece_hashes: Vec<[u8; 20]>,
    files: Vec<FileEntry>,
}

/// Placement of one output file within the logical byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFileSpan {
    pub path: PathBuf,
    pub start: u64,
    pub length: u64,
}

impl OutputFileSpan {
    /// Exclusive end offset in the logical stream.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Portion of a stream range that lands in a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanSlice {
    /// Index into the span list
    pub span: usize,
    /// Offset within that file
    pub file_offset: u64,
    /// Offset within the caller's buffer
    pub buffer_offset: usize,
    /// Number of bytes in this slice
    pub len: usize,
}

impl TorrentLayout {
    /// Builds and validates a layout.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidLayout` - If piece length is zero, the hash
    ///   count disagrees with the total length, or file lengths do not sum
    ///   to the total
    pub fn new(
        total_length: u64,
        piece_length: u32,
        piece_hashes: Vec<[u8; 20]>,
        files: Vec<FileEntry>,
    ) -> Result<Self, StorageError> {
        if piece_length == 0 {
            return Err(invalid("piece length is zero"));
        }
        if total_length == 0 {
            return Err(invalid("torrent has no content"));
        }

        let expected_pieces = total_length.div_ceil(u64::from(piece_length));
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(invalid(format!(
                "{} bytes at {} bytes per piece needs {} hashes, found {}",
                total_length,
                piece_length,
                expected_pieces,
                piece_hashes.len()
            )));
        }
        if expected_pieces > u64::from(u32::MAX) {
            return Err(invalid("too many pieces"));
        }

        let files_total: u64 = files.iter().map(|f| f.length).sum();
        if files_total != total_length {
            return Err(invalid(format!(
                "file lengths sum to {files_total}, expected {total_length}"
            )));
        }

        for file in &files {
            let escapes = file.relative_path.as_os_str().is_empty()
                || file
                    .relative_path
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_)));
            if escapes {
                return Err(invalid(format!(
                    "unsafe file path {}",
                    file.relative_path.display()
                )));
            }
        }

        Ok(Self {
            total_length,
            piece_length,
            piece_hashes,
            files,
        })
    }

    /// Builds the layout from parsed torrent metadata.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidLayout` - If the metadata geometry is inconsistent
    pub fn from_metadata(metadata: &TorrentMetadata) -> Result<Self, StorageError> {
        let files = metadata
            .files
            .iter()
            .map(|file| FileEntry {
                relative_path: file.path.iter().collect(),
                length: file.length,
            })
            .collect();

        Self::new(
            metadata.total_length,
            metadata.piece_length,
            metadata.piece_hashes.clone(),
            files,
        )
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Number of pieces in the torrent.
    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length of a specific piece; only the final piece may be shorter.
    pub fn piece_length_for(&self, index: PieceIndex) -> u32 {
        let last = self.num_pieces() - 1;
        if index.as_u32() < last {
            self.piece_length
        } else {
            (self.total_length - u64::from(self.piece_length) * u64::from(last)) as u32
        }
    }

    /// Offset of the piece's first byte in the logical stream.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * u64::from(self.piece_length)
    }

    /// Number of blocks the piece is split into.
    pub fn block_count(&self, index: PieceIndex) -> usize {
        self.piece_length_for(index).div_ceil(BLOCK_SIZE) as usize
    }

    /// Length of the block starting at `offset`, truncated at the piece end.
    pub fn block_length(&self, index: PieceIndex, offset: u32) -> u32 {
        BLOCK_SIZE.min(self.piece_length_for(index).saturating_sub(offset))
    }

    /// Expected SHA-1 digest of a piece.
    pub fn expected_hash(&self, index: PieceIndex) -> &[u8; 20] {
        &self.piece_hashes[index.as_usize()]
    }

    /// Whether the index addresses a piece of this torrent.
    pub fn contains(&self, index: PieceIndex) -> bool {
        index.as_u32() < self.num_pieces()
    }

    /// Places every file in the logical stream, rooted at `root`.
    pub fn file_spans(&self, root: &Path) -> Vec<OutputFileSpan> {
        let mut start = 0;
        self.files
            .iter()
            .map(|file| {
                let span = OutputFileSpan {
                    path: root.join(&file.relative_path),
                    start,
                    length: file.length,
                };
                start += file.length;
                span
            })
            .collect()
    }
}

/// Splits the stream range `[offset, offset + len)` into per-file slices.
///
/// Spans must be sorted and contiguous, as produced by
/// [`TorrentLayout::file_spans`]. Zero-length files never receive a slice.
pub fn intersect_spans(spans: &[OutputFileSpan], offset: u64, len: usize) -> Vec<SpanSlice> {
    let end = offset + len as u64;
    let first = spans.partition_point(|span| span.end() <= offset);

    spans[first..]
        .iter()
        .enumerate()
        .take_while(|(_, span)| span.start < end)
        .filter_map(|(i, span)| {
            let from = offset.max(span.start);
            let to = end.min(span.end());
            (from < to).then(|| SpanSlice {
                span: first + i,
                file_offset: from - span.start,
                buffer_offset: (from - offset) as usize,
                len: (to - from) as usize,
            })
        })
        .collect()
}

fn invalid(reason: impl Into<String>) -> StorageError {
    StorageError::InvalidLayout {
        reason: reason.into(),
    }
}
