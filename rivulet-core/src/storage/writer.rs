//! Background task persisting verified pieces.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use super::StorageError;
use super::files::OutputFiles;
use crate::torrent::PieceIndex;

/// A verified piece waiting to be written.
#[derive(Debug, Clone)]
pub struct CompletedPiece {
    pub index: PieceIndex,
    /// Offset of the piece in the logical stream
    pub offset: u64,
    pub data: Bytes,
}

/// Outcome of a writer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub written: usize,
    pub failed: usize,
}

type FlushCallback = Box<dyn Fn(PieceIndex) + Send + Sync>;

/// Single consumer of the completed-piece queue.
///
/// File I/O runs on the blocking pool. When shutdown is signalled the queue
/// is closed and whatever is already queued is still written.
pub struct DiskWriter {
    files: Arc<OutputFiles>,
    queue: mpsc::UnboundedReceiver<CompletedPiece>,
    on_flushed: Option<FlushCallback>,
}

impl DiskWriter {
    pub fn new(files: Arc<OutputFiles>, queue: mpsc::UnboundedReceiver<CompletedPiece>) -> Self {
        Self {
            files,
            queue,
            on_flushed: None,
        }
    }

    /// Registers a callback invoked after each piece reaches the files.
    pub fn on_flushed(mut self, callback: impl Fn(PieceIndex) + Send + Sync + 'static) -> Self {
        self.on_flushed = Some(Box::new(callback));
        self
    }

    /// Drains the queue until it closes or shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WriterReport {
        let mut report = WriterReport::default();

        loop {
            tokio::select! {
                piece = self.queue.recv() => match piece {
                    Some(piece) => self.persist(piece, &mut report).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.queue.close();
        while let Some(piece) = self.queue.recv().await {
            self.persist(piece, &mut report).await;
        }

        let files = Arc::clone(&self.files);
        match tokio::task::spawn_blocking(move || files.sync_all()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Failed to sync output files"),
            Err(e) => error!(error = %e, "Sync task panicked"),
        }

        info!(
            written = report.written,
            failed = report.failed,
            "Disk writer stopped"
        );
        report
    }

    async fn persist(&self, piece: CompletedPiece, report: &mut WriterReport) {
        let files = Arc::clone(&self.files);
        let CompletedPiece {
            index,
            offset,
            data,
        } = piece;

        let result = tokio::task::spawn_blocking(move || files.write_at(offset, &data))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)));

        match result.and_then(|inner| inner) {
            Ok(()) => {
                debug!(piece = %index, "Piece flushed to disk");
                report.written += 1;
                if let Some(callback) = &self.on_flushed {
                    callback(index);
                }
            }
            Err(e) => {
                error!(piece = %index, error = %e, "Failed to write piece");
                report.failed += 1;
            }
        }
    }
}
