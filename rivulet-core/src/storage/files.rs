//! Output files backing the torrent's logical byte stream.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use parking_lot::Mutex;
use tracing::debug;

use super::StorageError;
use super::layout::{OutputFileSpan, intersect_spans};

/// Open handles for every output file, behind a single I/O lock.
///
/// Offsets passed to [`write_at`](Self::write_at) and
/// [`read_at`](Self::read_at) address the logical stream; each call is split
/// across the files it touches.
pub struct OutputFiles {
    spans: Vec<OutputFileSpan>,
    total_length: u64,
    handles: Mutex<Vec<File>>,
}

impl OutputFiles {
    /// Creates or opens every output file and sizes it to its final length.
    ///
    /// Parent directories are created as needed. Existing files are only
    /// truncated when `resuming` is false.
    ///
    /// # Errors
    ///
    /// - `StorageError::FileCreation` - If any file cannot be created or sized
    pub fn create(spans: Vec<OutputFileSpan>, resuming: bool) -> Result<Self, StorageError> {
        let mut handles = Vec::with_capacity(spans.len());

        for span in &spans {
            let fail = |source| StorageError::FileCreation {
                path: span.path.clone(),
                source,
            };

            if let Some(parent) = span.path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(fail)?;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(!resuming)
                .open(&span.path)
                .map_err(fail)?;
            file.set_len(span.length).map_err(fail)?;

            debug!(path = %span.path.display(), length = span.length, resuming, "Prepared output file");
            handles.push(file);
        }

        let total_length = spans.last().map(OutputFileSpan::end).unwrap_or(0);
        Ok(Self {
            spans,
            total_length,
            handles: Mutex::new(handles),
        })
    }

    /// Writes `data` at logical `offset`, splitting it across files.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfRange` - If the range extends past the stream end
    /// - `StorageError::Io` - If a seek or write fails
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.check_range(offset, data.len())?;
        let slices = intersect_spans(&self.spans, offset, data.len());

        let mut handles = self.handles.lock();
        for slice in slices {
            let file = &mut handles[slice.span];
            file.seek(SeekFrom::Start(slice.file_offset))?;
            file.write_all(&data[slice.buffer_offset..slice.buffer_offset + slice.len])?;
        }
        Ok(())
    }

    /// Reads `length` bytes at logical `offset`, gathering across files.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfRange` - If the range extends past the stream end
    /// - `StorageError::Io` - If a seek or read fails
    pub fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        self.check_range(offset, length)?;
        let mut buffer = vec![0u8; length];
        let slices = intersect_spans(&self.spans, offset, length);

        let mut handles = self.handles.lock();
        for slice in slices {
            let file = &mut handles[slice.span];
            file.seek(SeekFrom::Start(slice.file_offset))?;
            file.read_exact(&mut buffer[slice.buffer_offset..slice.buffer_offset + slice.len])?;
        }
        Ok(buffer)
    }

    /// Flushes file contents to the operating system.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If any file fails to sync
    pub fn sync_all(&self) -> Result<(), StorageError> {
        for file in self.handles.lock().iter() {
            file.sync_data()?;
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, length: usize) -> Result<(), StorageError> {
        let in_range = offset
            .checked_add(length as u64)
            .is_some_and(|end| end <= self.total_length);
        if in_range {
            Ok(())
        } else {
            Err(StorageError::OutOfRange {
                offset,
                length: length as u64,
                total: self.total_length,
            })
        }
    }
}
