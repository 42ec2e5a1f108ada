//! Piece assembly engine.
//!
//! One arena slot per piece tracks block request state and the piece buffer.
//! All selection and bookkeeping happens under a single arena lock, so two
//! connections asking for work at the same moment never receive the same
//! block. Completed pieces are verified outside the lock, then handed to the
//! disk writer, recorded in the resume log, and announced to every peer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::peer_state::PeerBitfield;
use super::registry::{ConnectionRegistry, PeerHandle};
use super::scheduler::{LinearSelection, SelectionStrategy};
use super::{PieceIndex, TorrentError};
use crate::storage::{
    BLOCK_SIZE, CompletedPiece, DiskWriter, OutputFiles, ResumeLog, StorageError, TorrentLayout,
};

/// A block the caller should request from its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece_index: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

/// Result of handing a received block to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Piece already complete or being verified; data dropped
    Ignored,
    /// Block was already received
    Duplicate,
    /// Block stored, piece still incomplete
    Accepted,
    /// Block completed the piece and its hash matched
    PieceCompleted,
    /// Block completed the piece but the hash did not match; piece reset
    HashMismatch,
}

#[derive(Debug)]
enum BlockStatus {
    NotRequested,
    Requested {
        sent_at: Instant,
        requester: Weak<PeerHandle>,
    },
    Received,
}

#[derive(Debug)]
enum PieceSlot {
    /// Not yet touched; no buffer allocated
    Empty,
    Partial {
        data: Vec<u8>,
        blocks: Vec<BlockStatus>,
        received: usize,
    },
    /// All blocks received, hash check in progress
    Verifying,
    Complete,
}

#[derive(Debug)]
struct PieceArena {
    slots: Vec<PieceSlot>,
    completed: u32,
}

/// Owns every piece buffer and block status of one torrent.
pub struct BlockStore {
    layout: Arc<TorrentLayout>,
    order: Vec<PieceIndex>,
    arena: Mutex<PieceArena>,
    unflushed: Mutex<HashMap<PieceIndex, Bytes>>,
    files: Arc<OutputFiles>,
    resume_log: ResumeLog,
    registry: Arc<ConnectionRegistry>,
    completed_tx: mpsc::UnboundedSender<CompletedPiece>,
}

impl BlockStore {
    /// Prepares output files, replays the resume log, and returns the store
    /// with the writer that drains its completed pieces.
    ///
    /// Output files keep their contents when the resume log already lists
    /// verified pieces; otherwise they are truncated and resized.
    ///
    /// # Errors
    ///
    /// - `StorageError::FileCreation` - If an output file or the resume log
    ///   cannot be created
    /// - `StorageError::Io` - If the resume log cannot be read
    pub fn init(
        layout: Arc<TorrentLayout>,
        output_dir: &Path,
        resume_path: &Path,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<(Arc<Self>, DiskWriter), StorageError> {
        Self::init_with_strategy(
            layout,
            output_dir,
            resume_path,
            registry,
            &LinearSelection,
        )
    }

    /// Same as [`init`](Self::init) with an explicit selection strategy.
    ///
    /// # Errors
    ///
    /// See [`init`](Self::init), plus:
    ///
    /// - `StorageError::InvalidLayout` - If the strategy's order is not a
    ///   permutation of the piece indices
    pub fn init_with_strategy(
        layout: Arc<TorrentLayout>,
        output_dir: &Path,
        resume_path: &Path,
        registry: Arc<ConnectionRegistry>,
        strategy: &dyn SelectionStrategy,
    ) -> Result<(Arc<Self>, DiskWriter), StorageError> {
        let num_pieces = layout.num_pieces();
        let order = strategy.piece_order(num_pieces);
        check_piece_order(&order, num_pieces, strategy.name())?;

        let (resume_log, resume) = ResumeLog::open(resume_path, num_pieces)?;

        let resuming = !resume.completed.is_empty();
        let files = Arc::new(OutputFiles::create(layout.file_spans(output_dir), resuming)?);

        let mut slots: Vec<PieceSlot> = (0..num_pieces).map(|_| PieceSlot::Empty).collect();
        for &index in &resume.completed {
            slots[index as usize] = PieceSlot::Complete;
        }
        let completed = resume.completed.len() as u32;

        info!(
            pieces = num_pieces,
            resumed = completed,
            complete = resume.is_complete(num_pieces),
            strategy = strategy.name(),
            "Block store ready"
        );

        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let store = Arc::new(Self {
            order,
            layout,
            arena: Mutex::new(PieceArena { slots, completed }),
            unflushed: Mutex::new(HashMap::new()),
            files: Arc::clone(&files),
            resume_log,
            registry,
            completed_tx,
        });

        let weak: Weak<BlockStore> = Arc::downgrade(&store);
        let writer = DiskWriter::new(files, completed_rx).on_flushed(move |index| {
            if let Some(store) = weak.upgrade() {
                store.mark_flushed(index);
            }
        });

        Ok((store, writer))
    }

    pub fn layout(&self) -> &TorrentLayout {
        &self.layout
    }

    /// Picks the next block to request from a peer holding `peer_bitfield`
    /// and marks it requested by `requester`.
    ///
    /// Pieces are scanned in strategy order, skipping complete pieces and
    /// pieces the peer lacks. The requester's in-flight count is incremented
    /// for the returned block.
    pub fn request_next_block(
        &self,
        peer_bitfield: &PeerBitfield,
        now: Instant,
        requester: &Arc<PeerHandle>,
    ) -> Option<BlockRequest> {
        let mut arena = self.arena.lock();

        for &index in &self.order {
            if !peer_bitfield.has_piece(index) {
                continue;
            }

            let slot = &mut arena.slots[index.as_usize()];
            if matches!(slot, PieceSlot::Empty) {
                *slot = self.allocate(index);
            }

            let PieceSlot::Partial { blocks, .. } = slot else {
                continue;
            };
            let Some(block) = blocks
                .iter()
                .position(|status| matches!(status, BlockStatus::NotRequested))
            else {
                continue;
            };

            blocks[block] = BlockStatus::Requested {
                sent_at: now,
                requester: Arc::downgrade(requester),
            };
            requester.reserve_slot();

            let offset = block as u32 * BLOCK_SIZE;
            return Some(BlockRequest {
                piece_index: index,
                offset,
                length: self.layout.block_length(index, offset),
            });
        }

        None
    }

    /// Stores a received block. Completing a piece triggers verification and
    /// the completion hand-off.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ProtocolError` - If the index is out of range, the
    ///   offset is not block aligned, or the length does not match the block
    pub fn add_block(
        &self,
        piece_index: PieceIndex,
        begin: u32,
        data: &[u8],
    ) -> Result<BlockOutcome, TorrentError> {
        self.check_block(piece_index, begin, data.len())?;
        let block = (begin / BLOCK_SIZE) as usize;

        let buffer = {
            let mut arena = self.arena.lock();
            let slot = &mut arena.slots[piece_index.as_usize()];
            if matches!(slot, PieceSlot::Empty) {
                *slot = self.allocate(piece_index);
            }

            let PieceSlot::Partial {
                data: buffer,
                blocks,
                received,
            } = slot
            else {
                return Ok(BlockOutcome::Ignored);
            };

            if matches!(blocks[block], BlockStatus::Received) {
                return Ok(BlockOutcome::Duplicate);
            }

            let start = begin as usize;
            buffer[start..start + data.len()].copy_from_slice(data);
            blocks[block] = BlockStatus::Received;
            *received += 1;

            if *received < blocks.len() {
                return Ok(BlockOutcome::Accepted);
            }

            let PieceSlot::Partial { data, .. } = std::mem::replace(slot, PieceSlot::Verifying)
            else {
                return Ok(BlockOutcome::Ignored);
            };
            data
        };

        let digest = Sha1::digest(&buffer);
        if digest.as_slice() != self.layout.expected_hash(piece_index) {
            self.arena.lock().slots[piece_index.as_usize()] = PieceSlot::Empty;
            warn!(piece = %piece_index, "Piece failed hash check, discarding");
            return Ok(BlockOutcome::HashMismatch);
        }

        self.complete_piece(piece_index, Bytes::from(buffer));
        Ok(BlockOutcome::PieceCompleted)
    }

    /// Returns requests older than `timeout` to the pool.
    pub fn release_stale_requests(&self, timeout: Duration) -> usize {
        self.release_stale_requests_at(Instant::now(), timeout)
    }

    /// [`release_stale_requests`](Self::release_stale_requests) against an
    /// explicit clock reading.
    ///
    /// The original requester's in-flight count drops by one if that
    /// connection is still alive. Returns the number of blocks released.
    pub fn release_stale_requests_at(&self, now: Instant, timeout: Duration) -> usize {
        let mut arena = self.arena.lock();
        let mut released = 0;

        for slot in &mut arena.slots {
            let PieceSlot::Partial { blocks, .. } = slot else {
                continue;
            };
            for status in blocks.iter_mut() {
                let BlockStatus::Requested { sent_at, requester } = status else {
                    continue;
                };
                if now.saturating_duration_since(*sent_at) < timeout {
                    continue;
                }
                if let Some(handle) = requester.upgrade() {
                    handle.release_slot();
                }
                *status = BlockStatus::NotRequested;
                released += 1;
            }
        }

        released
    }

    /// Reads a block of a verified piece for upload.
    ///
    /// Returns `None` when the piece is not complete, the range is outside
    /// the piece, or the read fails.
    pub async fn fetch_block_for_upload(
        &self,
        piece_index: PieceIndex,
        begin: u32,
        length: u32,
    ) -> Option<Bytes> {
        if !self.is_complete(piece_index) {
            return None;
        }
        let end = u64::from(begin) + u64::from(length);
        if length == 0 || end > u64::from(self.layout.piece_length_for(piece_index)) {
            return None;
        }

        if let Some(piece) = self.unflushed.lock().get(&piece_index) {
            return Some(piece.slice(begin as usize..end as usize));
        }

        let files = Arc::clone(&self.files);
        let offset = self.layout.piece_offset(piece_index) + u64::from(begin);
        match tokio::task::spawn_blocking(move || files.read_at(offset, length as usize)).await {
            Ok(Ok(bytes)) => Some(Bytes::from(bytes)),
            Ok(Err(e)) => {
                warn!(piece = %piece_index, error = %e, "Failed to read block for upload");
                None
            }
            Err(e) => {
                warn!(piece = %piece_index, error = %e, "Upload read task failed");
                None
            }
        }
    }

    /// Drops the in-memory copy of a piece the writer has persisted.
    pub fn mark_flushed(&self, piece_index: PieceIndex) {
        self.unflushed.lock().remove(&piece_index);
    }

    pub fn is_complete(&self, piece_index: PieceIndex) -> bool {
        self.arena
            .lock()
            .slots
            .get(piece_index.as_usize())
            .is_some_and(|slot| matches!(slot, PieceSlot::Complete))
    }

    pub fn completed_count(&self) -> u32 {
        self.arena.lock().completed
    }

    pub fn is_download_complete(&self) -> bool {
        self.completed_count() == self.layout.num_pieces()
    }

    /// Our own have-set, for the post-handshake `bitfield` message.
    pub fn bitfield(&self) -> PeerBitfield {
        let arena = self.arena.lock();
        let mut bitfield = PeerBitfield::new(self.layout.num_pieces());
        for (index, slot) in arena.slots.iter().enumerate() {
            if matches!(slot, PieceSlot::Complete) {
                bitfield.set_piece(PieceIndex::new(index as u32));
            }
        }
        bitfield
    }

    /// Bytes still missing, for tracker announces.
    pub fn bytes_left(&self) -> u64 {
        let arena = self.arena.lock();
        let have: u64 = arena
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, PieceSlot::Complete))
            .map(|(index, _)| u64::from(self.layout.piece_length_for(PieceIndex::new(index as u32))))
            .sum();
        self.layout.total_length() - have
    }

    fn allocate(&self, index: PieceIndex) -> PieceSlot {
        let length = self.layout.piece_length_for(index) as usize;
        let blocks = self.layout.block_count(index);
        PieceSlot::Partial {
            data: vec![0u8; length],
            blocks: (0..blocks).map(|_| BlockStatus::NotRequested).collect(),
            received: 0,
        }
    }

    fn check_block(&self, index: PieceIndex, begin: u32, length: usize) -> Result<(), TorrentError> {
        if !self.layout.contains(index) {
            return Err(TorrentError::protocol(format!(
                "piece {index} out of range ({} pieces)",
                self.layout.num_pieces()
            )));
        }
        let piece_length = self.layout.piece_length_for(index);
        if begin % BLOCK_SIZE != 0 || begin >= piece_length {
            return Err(TorrentError::protocol(format!(
                "block offset {begin} invalid for piece {index} of {piece_length} bytes"
            )));
        }
        let expected = self.layout.block_length(index, begin) as usize;
        if length != expected {
            return Err(TorrentError::protocol(format!(
                "block {index}+{begin} is {length} bytes, expected {expected}"
            )));
        }
        Ok(())
    }

    fn complete_piece(&self, index: PieceIndex, data: Bytes) {
        self.unflushed.lock().insert(index, data.clone());

        let completed = {
            let mut arena = self.arena.lock();
            arena.slots[index.as_usize()] = PieceSlot::Complete;
            arena.completed += 1;
            arena.completed
        };

        let piece = CompletedPiece {
            index,
            offset: self.layout.piece_offset(index),
            data,
        };
        if self.completed_tx.send(piece).is_err() {
            warn!(piece = %index, "Disk writer stopped, piece stays in memory");
        }

        if let Err(e) = self.resume_log.append(index.as_u32()) {
            warn!(
                piece = %index,
                log = %self.resume_log.path().display(),
                error = %e,
                "Failed to record piece in resume log"
            );
        }

        let peers = self.registry.broadcast_have(index);
        debug!(piece = %index, peers, "Announced completed piece");
        info!(
            piece = %index,
            completed,
            total = self.layout.num_pieces(),
            "Piece verified"
        );
    }
}

fn check_piece_order(
    order: &[PieceIndex],
    num_pieces: u32,
    strategy: &str,
) -> Result<(), StorageError> {
    let mut seen = vec![false; num_pieces as usize];
    for index in order {
        match seen.get_mut(index.as_usize()) {
            Some(slot) if !*slot => *slot = true,
            Some(_) => {
                return Err(StorageError::InvalidLayout {
                    reason: format!("{strategy} selection lists piece {index} twice"),
                });
            }
            None => {
                return Err(StorageError::InvalidLayout {
                    reason: format!(
                        "{strategy} selection returned piece {index} of {num_pieces}"
                    ),
                });
            }
        }
    }
    if order.len() != num_pieces as usize {
        return Err(StorageError::InvalidLayout {
            reason: format!(
                "{strategy} selection covers {} of {num_pieces} pieces",
                order.len()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::SocketAddr;

    use tempfile::TempDir;
    use tokio::sync::watch;

    use super::*;
    use crate::storage::FileEntry;
    use crate::torrent::protocol::PeerMessage;

    struct Fixture {
        dir: TempDir,
        content: Vec<u8>,
        layout: Arc<TorrentLayout>,
        registry: Arc<ConnectionRegistry>,
    }

    impl Fixture {
        fn new(total: usize, piece_length: u32) -> Self {
            let content: Vec<u8> = (0..total).map(|i| (i * 31 % 251) as u8).collect();
            let hashes = content
                .chunks(piece_length as usize)
                .map(|chunk| Sha1::digest(chunk).into())
                .collect();
            let layout = TorrentLayout::new(
                total as u64,
                piece_length,
                hashes,
                vec![FileEntry {
                    relative_path: "payload.bin".into(),
                    length: total as u64,
                }],
            )
            .unwrap();
            Self {
                dir: TempDir::new().unwrap(),
                content,
                layout: Arc::new(layout),
                registry: Arc::new(ConnectionRegistry::new()),
            }
        }

        fn resume_path(&self) -> std::path::PathBuf {
            self.dir.path().join("state.resume")
        }

        fn open(&self) -> (Arc<BlockStore>, DiskWriter) {
            BlockStore::init(
                Arc::clone(&self.layout),
                &self.dir.path().join("out"),
                &self.resume_path(),
                Arc::clone(&self.registry),
            )
            .unwrap()
        }

        fn block(&self, request: &BlockRequest) -> &[u8] {
            let start = self.layout.piece_offset(request.piece_index) as usize
                + request.offset as usize;
            &self.content[start..start + request.length as usize]
        }
    }

    fn peer() -> (Arc<PeerHandle>, mpsc::UnboundedReceiver<PeerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let address = SocketAddr::from(([127, 0, 0, 1], 6881));
        (Arc::new(PeerHandle::new(address, tx)), rx)
    }

    fn full_bitfield(pieces: u32) -> PeerBitfield {
        let mut bitfield = PeerBitfield::new(pieces);
        for index in 0..pieces {
            bitfield.set_piece(PieceIndex::new(index));
        }
        bitfield
    }

    #[test]
    fn test_linear_request_order() {
        let fixture = Fixture::new(3 * 32_768, 32_768);
        let (store, _writer) = fixture.open();
        let (handle, _rx) = peer();
        let bitfield = full_bitfield(3);
        let now = Instant::now();

        let requests: Vec<(u32, u32)> = std::iter::from_fn(|| {
            store
                .request_next_block(&bitfield, now, &handle)
                .map(|r| (r.piece_index.as_u32(), r.offset))
        })
        .collect();

        assert_eq!(
            requests,
            vec![(0, 0), (0, 16384), (1, 0), (1, 16384), (2, 0), (2, 16384)]
        );
        assert_eq!(handle.in_flight(), 6);
    }

    #[test]
    fn test_only_advertised_piece_is_requested() {
        let fixture = Fixture::new(8 * 16_384, 16_384);
        let (store, _writer) = fixture.open();
        let (handle, _rx) = peer();

        // 0b0000_0100: the peer holds only piece 5.
        let bitfield = PeerBitfield::from_payload(&[0x04], 8);
        let request = store
            .request_next_block(&bitfield, Instant::now(), &handle)
            .unwrap();
        assert_eq!(
            request,
            BlockRequest {
                piece_index: PieceIndex::new(5),
                offset: 0,
                length: 16_384
            }
        );
        assert!(
            store
                .request_next_block(&bitfield, Instant::now(), &handle)
                .is_none()
        );
    }

    #[test]
    fn test_short_final_piece_geometry() {
        let fixture = Fixture::new(1_000_000, 262_144);
        let (store, _writer) = fixture.open();
        let (handle, _rx) = peer();
        let last = PieceIndex::new(3);
        assert_eq!(fixture.layout.piece_length_for(last), 213_568);

        let mut bitfield = PeerBitfield::new(4);
        bitfield.set_piece(last);
        let requests: Vec<BlockRequest> = std::iter::from_fn(|| {
            store.request_next_block(&bitfield, Instant::now(), &handle)
        })
        .collect();

        assert_eq!(requests.len(), 14);
        assert!(requests[..13].iter().all(|r| r.length == 16_384));
        assert_eq!(requests[13].offset, 13 * 16_384);
        assert_eq!(requests[13].length, 576);

        for request in &requests[..13] {
            assert_eq!(
                store
                    .add_block(last, request.offset, fixture.block(request))
                    .unwrap(),
                BlockOutcome::Accepted
            );
        }
        assert!(!store.is_complete(last));
        assert_eq!(
            store
                .add_block(last, requests[13].offset, fixture.block(&requests[13]))
                .unwrap(),
            BlockOutcome::PieceCompleted
        );
        assert!(store.is_complete(last));
        assert_eq!(store.completed_count(), 1);
    }

    struct ScrambledSelection(Vec<u32>);

    impl SelectionStrategy for ScrambledSelection {
        fn name(&self) -> &'static str {
            "scrambled"
        }

        fn piece_order(&self, _num_pieces: u32) -> Vec<PieceIndex> {
            self.0.iter().copied().map(PieceIndex::new).collect()
        }
    }

    #[test]
    fn test_selection_order_is_validated() {
        let fixture = Fixture::new(3 * 16_384, 16_384);
        let init = |order: Vec<u32>| {
            BlockStore::init_with_strategy(
                Arc::clone(&fixture.layout),
                &fixture.dir.path().join("out"),
                &fixture.resume_path(),
                Arc::clone(&fixture.registry),
                &ScrambledSelection(order),
            )
        };

        for bad in [vec![0, 1, 3], vec![0, 1, 1], vec![2, 0]] {
            assert!(matches!(
                init(bad),
                Err(StorageError::InvalidLayout { .. })
            ));
        }

        let (store, _writer) = init(vec![2, 0, 1]).unwrap();
        let (handle, _rx) = peer();
        let request = store
            .request_next_block(&full_bitfield(3), Instant::now(), &handle)
            .unwrap();
        assert_eq!(request.piece_index, PieceIndex::new(2));
    }

    #[tokio::test]
    async fn test_completion_verifies_and_hands_off() {
        let fixture = Fixture::new(2 * 32_768, 32_768);
        let (store, writer) = fixture.open();
        let (handle, mut rx) = peer();
        fixture.registry.register(&handle);
        let bitfield = full_bitfield(2);

        let first = store
            .request_next_block(&bitfield, Instant::now(), &handle)
            .unwrap();
        let second = store
            .request_next_block(&bitfield, Instant::now(), &handle)
            .unwrap();

        assert_eq!(
            store.add_block(first.piece_index, first.offset, fixture.block(&first)).unwrap(),
            BlockOutcome::Accepted
        );
        assert_eq!(
            store.add_block(second.piece_index, second.offset, fixture.block(&second)).unwrap(),
            BlockOutcome::PieceCompleted
        );

        assert!(store.is_complete(PieceIndex::new(0)));
        assert_eq!(store.completed_count(), 1);
        assert_eq!(store.bytes_left(), 32_768);
        assert_eq!(store.bitfield().as_bytes(), &[0x80]);
        assert_eq!(
            rx.try_recv().unwrap(),
            PeerMessage::Have {
                piece_index: PieceIndex::new(0)
            }
        );

        // Served from memory before the writer runs.
        let block = store
            .fetch_block_for_upload(PieceIndex::new(0), 16_384, 16_384)
            .await
            .unwrap();
        assert_eq!(block.as_ref(), &fixture.content[16_384..32_768]);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        let report = writer.run(shutdown_rx).await;
        assert_eq!(report.written, 1);
        assert!(store.unflushed.lock().is_empty());

        // Now served from disk.
        let block = store
            .fetch_block_for_upload(PieceIndex::new(0), 0, 100)
            .await
            .unwrap();
        assert_eq!(block.as_ref(), &fixture.content[..100]);

        let on_disk = std::fs::read(fixture.dir.path().join("out/payload.bin")).unwrap();
        assert_eq!(&on_disk[..32_768], &fixture.content[..32_768]);

        let log = std::fs::read(fixture.resume_path()).unwrap();
        assert_eq!(log, 0u32.to_ne_bytes());
    }

    #[test]
    fn test_hash_mismatch_resets_piece() {
        let fixture = Fixture::new(16_384, 16_384);
        let (store, _writer) = fixture.open();
        let (handle, _rx) = peer();
        let bitfield = full_bitfield(1);

        let request = store
            .request_next_block(&bitfield, Instant::now(), &handle)
            .unwrap();
        let garbage = vec![0xEEu8; request.length as usize];
        assert_eq!(
            store.add_block(request.piece_index, request.offset, &garbage).unwrap(),
            BlockOutcome::HashMismatch
        );
        assert!(!store.is_complete(PieceIndex::new(0)));

        // Every block is requestable again.
        let retry = store
            .request_next_block(&bitfield, Instant::now(), &handle)
            .unwrap();
        assert_eq!(retry, request);
        assert_eq!(
            store.add_block(retry.piece_index, retry.offset, fixture.block(&retry)).unwrap(),
            BlockOutcome::PieceCompleted
        );
    }

    #[test]
    fn test_complete_piece_ignores_further_blocks() {
        let fixture = Fixture::new(16_384, 16_384);
        let (store, _writer) = fixture.open();
        let (handle, _rx) = peer();

        let request = store
            .request_next_block(&full_bitfield(1), Instant::now(), &handle)
            .unwrap();
        store
            .add_block(request.piece_index, request.offset, fixture.block(&request))
            .unwrap();

        let outcome = store
            .add_block(request.piece_index, request.offset, &[0u8; 16_384])
            .unwrap();
        assert_eq!(outcome, BlockOutcome::Ignored);
        assert_eq!(store.completed_count(), 1);
        assert!(
            store
                .request_next_block(&full_bitfield(1), Instant::now(), &handle)
                .is_none()
        );
    }

    #[test]
    fn test_duplicate_block() {
        let fixture = Fixture::new(32_768, 32_768);
        let (store, _writer) = fixture.open();
        let data = &fixture.content[..16_384];

        assert_eq!(
            store.add_block(PieceIndex::new(0), 0, data).unwrap(),
            BlockOutcome::Accepted
        );
        assert_eq!(
            store.add_block(PieceIndex::new(0), 0, data).unwrap(),
            BlockOutcome::Duplicate
        );
    }

    #[test]
    fn test_protocol_violations() {
        let fixture = Fixture::new(20_000, 16_384);
        let (store, _writer) = fixture.open();

        let out_of_range = store.add_block(PieceIndex::new(2), 0, &[0u8; 16_384]);
        assert!(matches!(out_of_range, Err(TorrentError::ProtocolError { .. })));

        let misaligned = store.add_block(PieceIndex::new(0), 100, &[0u8; 16_384]);
        assert!(matches!(misaligned, Err(TorrentError::ProtocolError { .. })));

        // Piece 1 is 3_616 bytes long.
        let wrong_length = store.add_block(PieceIndex::new(1), 0, &[0u8; 16_384]);
        assert!(matches!(wrong_length, Err(TorrentError::ProtocolError { .. })));
        assert!(store.add_block(PieceIndex::new(1), 0, &[0u8; 3_616]).is_ok());
    }

    #[test]
    fn test_stale_requests_are_reissued() {
        let fixture = Fixture::new(16_384, 16_384);
        let (store, _writer) = fixture.open();
        let (slow, _rx) = peer();
        let (fast, _rx2) = peer();
        let bitfield = full_bitfield(1);
        let timeout = Duration::from_secs(30);
        let t0 = Instant::now();

        let request = store.request_next_block(&bitfield, t0, &slow).unwrap();
        assert!(store.request_next_block(&bitfield, t0, &fast).is_none());

        assert_eq!(
            store.release_stale_requests_at(t0 + Duration::from_secs(29), timeout),
            0
        );
        assert_eq!(store.release_stale_requests_at(t0 + timeout, timeout), 1);
        assert_eq!(slow.in_flight(), 0);

        let reissued = store
            .request_next_block(&bitfield, t0 + timeout, &fast)
            .unwrap();
        assert_eq!(reissued, request);
        assert_eq!(fast.in_flight(), 1);
    }

    #[test]
    fn test_stale_request_from_closed_connection() {
        let fixture = Fixture::new(16_384, 16_384);
        let (store, _writer) = fixture.open();
        let (gone, _rx) = peer();
        let t0 = Instant::now();

        store.request_next_block(&full_bitfield(1), t0, &gone).unwrap();
        drop(gone);

        assert_eq!(
            store.release_stale_requests_at(t0 + Duration::from_secs(60), Duration::from_secs(30)),
            1
        );
    }

    #[test]
    fn test_concurrent_requests_never_duplicate() {
        let fixture = Fixture::new(64 * 16_384, 4 * 16_384);
        let (store, _writer) = fixture.open();
        let bitfield = full_bitfield(16);
        let now = Instant::now();

        let handed_out: Vec<BlockRequest> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let (handle, _rx) = peer();
                        std::iter::from_fn(|| store.request_next_block(&bitfield, now, &handle))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect()
        });

        let unique: HashSet<_> = handed_out.iter().copied().collect();
        assert_eq!(handed_out.len(), 64);
        assert_eq!(unique.len(), 64);
    }

    #[test]
    fn test_resume_skips_logged_pieces() {
        let fixture = Fixture::new(5 * 16_384, 16_384);
        let out = fixture.dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("payload.bin"), &fixture.content).unwrap();
        let records: Vec<u8> = [0u32, 1, 2].into_iter().flat_map(u32::to_ne_bytes).collect();
        std::fs::write(fixture.resume_path(), records).unwrap();

        let (store, _writer) = fixture.open();
        let (handle, _rx) = peer();

        assert_eq!(store.completed_count(), 3);
        assert!(store.is_complete(PieceIndex::new(2)));
        assert!(!store.is_download_complete());
        assert_eq!(store.bitfield().as_bytes(), &[0xE0]);
        assert_eq!(store.bytes_left(), 2 * 16_384);

        let request = store
            .request_next_block(&full_bitfield(5), Instant::now(), &handle)
            .unwrap();
        assert_eq!(request.piece_index, PieceIndex::new(3));

        // Existing content survived initialization.
        let on_disk = std::fs::read(out.join("payload.bin")).unwrap();
        assert_eq!(on_disk, fixture.content);
    }

    #[tokio::test]
    async fn test_upload_refused_for_incomplete_piece() {
        let fixture = Fixture::new(16_384, 16_384);
        let (store, _writer) = fixture.open();
        assert!(
            store
                .fetch_block_for_upload(PieceIndex::new(0), 0, 16_384)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_sweeper_task_releases_requests() {
        let fixture = Fixture::new(16_384, 16_384);
        let (store, _writer) = fixture.open();
        let (handle, _rx) = peer();
        store
            .request_next_block(&full_bitfield(1), Instant::now(), &handle)
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(crate::torrent::scheduler::run_request_sweeper(
            Arc::clone(&store),
            Duration::from_millis(10),
            Duration::from_millis(20),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.in_flight(), 0);

        shutdown_tx.send(true).unwrap();
        sweeper.await.unwrap();
    }
}
