//! Core types for the BitTorrent wire protocol

use std::fmt;

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol identifier carried in every handshake.
pub const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// BitTorrent peer identifier.
///
/// 20-byte identifier sent in handshakes and tracker announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a peer ID: the client prefix (Azureus style, e.g.
    /// `-RV0001-`) followed by random bytes.
    pub fn generate(client_prefix: &str) -> Self {
        let mut id: [u8; 20] = rand::random();
        let prefix = client_prefix.as_bytes();
        let len = prefix.len().min(id.len());
        id[..len].copy_from_slice(&prefix[..len]);
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0[..8]))?;
        f.write_str(&hex::encode(&self.0[8..]))
    }
}

/// BitTorrent wire protocol messages (BEP 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length frame keeping the connection open
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Sender now holds a verified piece
    Have { piece_index: PieceIndex },
    /// Packed piece availability, most significant bit first
    Bitfield { bitfield: Bytes },
    /// Ask for a block of a piece
    Request {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// Block of piece data
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    /// Withdraw an earlier request
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// DHT listen port
    Port { port: u16 },
}

impl PeerMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
            PeerMessage::Port { .. } => "port",
        }
    }
}

/// Peer handshake contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandshake {
    /// Reserved bytes for protocol extensions (always zero when we send)
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Creates a handshake with zeroed reserved bytes.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Lifecycle of a peer connection.
///
/// Outbound connections start at `Connecting`; accepted sockets start at
/// `Handshaking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connection in progress
    Connecting,
    /// Exchanging the 68-byte handshake
    Handshaking,
    /// Handshake verified, messages flowing
    Active,
    /// Socket released
    Closed,
}
