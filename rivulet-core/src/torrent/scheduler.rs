//! Block request scheduling.
//!
//! Selection and marking happen inside [`BlockStore`] under its arena lock;
//! this module supplies the piece order and the periodic sweep that returns
//! stalled requests to the pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::PieceIndex;
use super::block_store::BlockStore;

/// Order in which pieces are scanned for requestable blocks.
pub trait SelectionStrategy: Send + Sync {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Every piece index exactly once, in scan order.
    fn piece_order(&self, num_pieces: u32) -> Vec<PieceIndex>;
}

/// Ascending piece index; blocks within a piece go by ascending offset.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearSelection;

impl SelectionStrategy for LinearSelection {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn piece_order(&self, num_pieces: u32) -> Vec<PieceIndex> {
        (0..num_pieces).map(PieceIndex::new).collect()
    }
}

/// Releases stale requests every `interval` until shutdown.
pub async fn run_request_sweeper(
    store: Arc<BlockStore>,
    interval: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let released = store.release_stale_requests(timeout);
                if released > 0 {
                    debug!(released, "Released stale block requests");
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }

    info!("Request sweeper stopped");
}
