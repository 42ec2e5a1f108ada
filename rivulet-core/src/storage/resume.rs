//! Append-only log of verified piece indices.
//!
//! Each record is a native-endian `u32`. The log is replayed once at startup,
//! before any network activity, and trusted without re-hashing.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::StorageError;

const RECORD_SIZE: u64 = 4;

/// Pieces recovered from an existing resume log.
#[derive(Debug, Clone, Default)]
pub struct ResumeState {
    /// Whether a log file was already present
    pub existed: bool,
    /// Verified piece indices found in the log
    pub completed: BTreeSet<u32>,
}

impl ResumeState {
    /// Whether the log covers every piece.
    pub fn is_complete(&self, num_pieces: u32) -> bool {
        self.completed.len() as u64 == u64::from(num_pieces)
    }
}

/// Writable handle on the resume log.
pub struct ResumeLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ResumeLog {
    /// Opens (or creates) the log at `path` and replays its records.
    ///
    /// A trailing partial record, left by a crash mid-append, is cut off so
    /// later appends stay aligned. Indices outside `0..num_pieces` are skipped.
    ///
    /// # Errors
    ///
    /// - `StorageError::FileCreation` - If the log cannot be opened
    /// - `StorageError::Io` - If reading or truncating fails
    pub fn open(path: &Path, num_pieces: u32) -> Result<(Self, ResumeState), StorageError> {
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|source| StorageError::FileCreation {
                path: path.to_path_buf(),
                source,
            })?;

        let mut raw = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut raw)?;

        let whole = raw.len() as u64 / RECORD_SIZE * RECORD_SIZE;
        if whole != raw.len() as u64 {
            warn!(
                path = %path.display(),
                dangling = raw.len() as u64 - whole,
                "Resume log ends in a partial record, truncating"
            );
            file.set_len(whole)?;
        }

        let mut completed = BTreeSet::new();
        for chunk in raw[..whole as usize].chunks_exact(RECORD_SIZE as usize) {
            let index = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if index < num_pieces {
                completed.insert(index);
            } else {
                warn!(index, num_pieces, "Ignoring out-of-range resume record");
            }
        }

        if existed {
            info!(
                path = %path.display(),
                pieces = completed.len(),
                "Replayed resume log"
            );
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                file: Mutex::new(file),
            },
            ResumeState { existed, completed },
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one verified piece index and flushes it.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the write or flush fails
    pub fn append(&self, index: u32) -> Result<(), StorageError> {
        let mut file = self.file.lock();
        file.write_all(&index.to_ne_bytes())?;
        file.flush()?;
        Ok(())
    }
}
