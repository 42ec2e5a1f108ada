//! Per-peer protocol state machine.
//!
//! A connection runs as one task over any duplex byte stream. Reads and
//! dispatch happen on that task; outbound messages go through the
//! [`PeerHandle`] queue to a writer task that owns the write half, so
//! `have` broadcasts from other connections never block on this socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use super::block_store::{BlockOutcome, BlockStore};
use super::choking::{ChokeDecision, ChokePolicy};
use super::peer_state::PeerConnectionState;
use super::protocol::{
    ConnectionState, PeerHandshake, PeerId, PeerMessage, accept_handshake, initiate_handshake,
    read_message, write_message,
};
use super::registry::{ConnectionRegistry, PeerHandle};
use super::stats::SessionStats;
use super::{InfoHash, PieceIndex, TorrentError};
use crate::config::TorrentConfig;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// We dialed; we send the handshake first
    Outbound,
    /// Remote dialed; we verify its handshake before answering
    Inbound,
}

/// Everything a connection shares with the rest of the session.
#[derive(Clone)]
pub struct PeerContext {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub store: Arc<BlockStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub choke_policy: Arc<dyn ChokePolicy>,
    pub stats: Arc<SessionStats>,
    pub config: TorrentConfig,
    /// Largest accepted frame length
    pub max_frame_length: u32,
}

/// One remote peer.
pub struct PeerConnection {
    address: SocketAddr,
    direction: ConnectionDirection,
    ctx: PeerContext,
    state: ConnectionState,
    peer: PeerConnectionState,
}

impl PeerConnection {
    /// Outbound connections start at `Connecting`, accepted sockets at
    /// `Handshaking`.
    pub fn new(address: SocketAddr, direction: ConnectionDirection, ctx: PeerContext) -> Self {
        let piece_count = ctx.store.layout().num_pieces();
        let state = match direction {
            ConnectionDirection::Outbound => ConnectionState::Connecting,
            ConnectionDirection::Inbound => ConnectionState::Handshaking,
        };
        Self {
            address,
            direction,
            ctx,
            state,
            peer: PeerConnectionState::new(piece_count),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    /// Dials the peer and runs the connection until it closes.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Connect failed or timed out,
    ///   or the connection was created as inbound
    /// - See [`run`](Self::run) for errors after the TCP connect
    pub async fn connect_outbound(
        mut self,
        connect_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TorrentError> {
        let address = self.address;
        if self.direction != ConnectionDirection::Outbound {
            self.state = ConnectionState::Closed;
            return Err(TorrentError::PeerConnectionError {
                reason: format!("inbound connection from {address} cannot dial"),
            });
        }

        let stream = tokio::select! {
            connected = tokio::time::timeout(connect_timeout, TcpStream::connect(address)) => {
                match connected {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        self.state = ConnectionState::Closed;
                        return Err(TorrentError::PeerConnectionError {
                            reason: format!("connect to {address} failed: {e}"),
                        });
                    }
                    Err(_) => {
                        self.state = ConnectionState::Closed;
                        return Err(TorrentError::PeerConnectionError {
                            reason: format!("connect to {address} timed out"),
                        });
                    }
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                self.state = ConnectionState::Closed;
                return Ok(());
            }
        };

        let _ = stream.set_nodelay(true);
        self.run(stream, shutdown).await
    }

    /// Handshakes over `stream` and runs the message loop until the peer
    /// disconnects, a protocol violation occurs, or shutdown is signalled.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ProtocolError` - Bad handshake, oversized or
    ///   malformed frame, or an invalid block
    /// - `TorrentError::PeerConnectionError` - Peer is ourselves, or the
    ///   writer side failed
    /// - `TorrentError::Io` - Stream failure, including remote close
    pub async fn run<S>(
        mut self,
        mut stream: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TorrentError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.state = ConnectionState::Handshaking;
        let ours = PeerHandshake::new(self.ctx.info_hash, self.ctx.peer_id);
        let direction = self.direction;

        let handshake = tokio::select! {
            result = async {
                match direction {
                    ConnectionDirection::Outbound => initiate_handshake(&mut stream, &ours).await,
                    ConnectionDirection::Inbound => accept_handshake(&mut stream, &ours).await,
                }
            } => result,
            _ = shutdown.wait_for(|stop| *stop) => {
                self.state = ConnectionState::Closed;
                return Ok(());
            }
        };
        let theirs = match handshake {
            Ok(theirs) => theirs,
            Err(e) => {
                self.state = ConnectionState::Closed;
                debug!(peer = %self.address, error = %e, "Handshake failed");
                return Err(e);
            }
        };
        if theirs.peer_id == self.ctx.peer_id {
            self.state = ConnectionState::Closed;
            return Err(TorrentError::PeerConnectionError {
                reason: "connected to ourselves".to_string(),
            });
        }

        self.state = ConnectionState::Active;
        debug!(
            peer = %self.address,
            remote_id = %theirs.peer_id,
            ?direction,
            "Peer connected"
        );

        let (mut reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(PeerHandle::new(self.address, outbound_tx));
        let mut writer_task = tokio::spawn(write_loop(writer, outbound_rx));

        self.ctx.registry.register(&handle);
        self.ctx.stats.peer_connected();

        let have = self.ctx.store.bitfield();
        let result = if !have.is_empty() && !handle.queue(PeerMessage::Bitfield {
            bitfield: have.to_payload(),
        }) {
            Err(writer_gone())
        } else {
            let max_frame_length = self.ctx.max_frame_length;
            loop {
                tokio::select! {
                    message = read_message(&mut reader, max_frame_length) => {
                        let outcome = match message {
                            Ok(message) => self.dispatch(&handle, message).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = outcome {
                            break Err(e);
                        }
                    }
                    finished = &mut writer_task => {
                        break match finished {
                            Ok(result) => result.and(Err(writer_gone())),
                            Err(e) => Err(TorrentError::PeerConnectionError {
                                reason: format!("writer task failed: {e}"),
                            }),
                        };
                    }
                    _ = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => break Ok(()),
                }
            }
        };

        writer_task.abort();
        self.state = ConnectionState::Closed;
        self.ctx.stats.peer_disconnected();
        debug!(
            peer = %self.address,
            in_flight = handle.in_flight(),
            "Peer disconnected"
        );
        result
    }

    async fn dispatch(
        &mut self,
        handle: &Arc<PeerHandle>,
        message: PeerMessage,
    ) -> Result<(), TorrentError> {
        trace!(peer = %self.address, kind = message.kind(), "Received message");

        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => self.peer.am_choked = true,
            PeerMessage::Unchoke => {
                self.peer.am_choked = false;
                self.maybe_request_next(handle)?;
            }
            PeerMessage::Interested => {
                self.peer.peer_interested = true;
                let decision = self.ctx.choke_policy.on_interested(self.address);
                self.apply_choke_decision(handle, decision)?;
            }
            PeerMessage::NotInterested => {
                self.peer.peer_interested = false;
                let decision = self.ctx.choke_policy.on_not_interested(self.address);
                self.apply_choke_decision(handle, decision)?;
            }
            PeerMessage::Have { piece_index } => {
                if piece_index.as_u32() >= self.peer.bitfield().piece_count() {
                    return Err(TorrentError::protocol(format!(
                        "have for piece {piece_index} out of range"
                    )));
                }
                self.peer.peer_has_piece(piece_index);
                if !self.ctx.store.is_complete(piece_index) {
                    self.declare_interest(handle)?;
                }
                self.maybe_request_next(handle)?;
            }
            PeerMessage::Bitfield { bitfield } => {
                self.peer.replace_bitfield(&bitfield);
                debug!(
                    peer = %self.address,
                    pieces = self.peer.bitfield().count_set(),
                    "Bitfield received"
                );
                let needed = self
                    .peer
                    .bitfield()
                    .iter_set()
                    .any(|index| !self.ctx.store.is_complete(index));
                if needed {
                    self.declare_interest(handle)?;
                }
                self.maybe_request_next(handle)?;
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => self.serve_request(handle, piece_index, offset, length).await?,
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                handle.release_slot();
                self.ctx.stats.record_download(data.len() as u64);
                match self.ctx.store.add_block(piece_index, offset, &data)? {
                    BlockOutcome::PieceCompleted => {
                        debug!(peer = %self.address, piece = %piece_index, "Piece verified");
                    }
                    BlockOutcome::HashMismatch => {
                        debug!(peer = %self.address, piece = %piece_index, "Piece discarded");
                    }
                    BlockOutcome::Duplicate | BlockOutcome::Ignored | BlockOutcome::Accepted => {}
                }
                self.maybe_request_next(handle)?;
            }
            PeerMessage::Cancel { .. } | PeerMessage::Port { .. } => {}
        }

        Ok(())
    }

    /// Keeps the request pipeline full while we are interested and unchoked.
    fn maybe_request_next(&mut self, handle: &Arc<PeerHandle>) -> Result<(), TorrentError> {
        let limit = self.ctx.config.pipeline_limit;
        while self.peer.can_request() && handle.in_flight() < limit {
            let Some(request) =
                self.ctx
                    .store
                    .request_next_block(self.peer.bitfield(), Instant::now(), handle)
            else {
                break;
            };

            let sent = handle.queue(PeerMessage::Request {
                piece_index: request.piece_index,
                offset: request.offset,
                length: request.length,
            });
            if !sent {
                return Err(writer_gone());
            }
        }
        Ok(())
    }

    fn declare_interest(&mut self, handle: &PeerHandle) -> Result<(), TorrentError> {
        if self.peer.am_interested {
            return Ok(());
        }
        self.peer.am_interested = true;
        send(handle, PeerMessage::Interested)
    }

    fn apply_choke_decision(
        &mut self,
        handle: &PeerHandle,
        decision: ChokeDecision,
    ) -> Result<(), TorrentError> {
        match decision {
            ChokeDecision::Unchoke => {
                self.peer.peer_choked = false;
                send(handle, PeerMessage::Unchoke)
            }
            ChokeDecision::Choke => {
                self.peer.peer_choked = true;
                send(handle, PeerMessage::Choke)
            }
            ChokeDecision::Unchanged => Ok(()),
        }
    }

    async fn serve_request(
        &mut self,
        handle: &PeerHandle,
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<(), TorrentError> {
        if self.peer.peer_choked {
            trace!(peer = %self.address, piece = %piece_index, "Ignoring request from choked peer");
            return Ok(());
        }
        if length > self.ctx.config.max_upload_request {
            debug!(peer = %self.address, length, "Ignoring oversized request");
            return Ok(());
        }

        let Some(data) = self
            .ctx
            .store
            .fetch_block_for_upload(piece_index, offset, length)
            .await
        else {
            trace!(peer = %self.address, piece = %piece_index, offset, "Requested block unavailable");
            return Ok(());
        };

        let uploaded = data.len() as u64;
        send(
            handle,
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            },
        )?;
        self.ctx.stats.record_upload(uploaded);
        Ok(())
    }
}

fn send(handle: &PeerHandle, message: PeerMessage) -> Result<(), TorrentError> {
    if handle.queue(message) {
        Ok(())
    } else {
        Err(writer_gone())
    }
}

fn writer_gone() -> TorrentError {
    TorrentError::PeerConnectionError {
        reason: "outbound queue closed".to_string(),
    }
}

async fn write_loop<W>(
    mut writer: WriteHalf<W>,
    mut outbound: mpsc::UnboundedReceiver<PeerMessage>,
) -> Result<(), TorrentError>
where
    W: AsyncRead + AsyncWrite,
{
    while let Some(message) = outbound.recv().await {
        write_message(&mut writer, &message).await?;
        // Batch whatever queued up behind this message before flushing.
        while let Ok(next) = outbound.try_recv() {
            write_message(&mut writer, &next).await?;
        }
        writer.flush().await?;
    }
    Ok(())
}
