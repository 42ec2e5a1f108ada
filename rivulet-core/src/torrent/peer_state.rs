//! Per-connection peer state: the remote have-set and choke/interest flags

use bytes::Bytes;

use crate::torrent::PieceIndex;

/// Bitfield representing which pieces a peer has.
///
/// Bits are packed most significant bit first: piece 0 is the high bit of
/// byte 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBitfield {
    bits: Vec<u8>,
    piece_count: u32,
}

impl PeerBitfield {
    /// Creates an empty bitfield for the given number of pieces.
    pub fn new(piece_count: u32) -> Self {
        Self {
            bits: vec![0u8; piece_count.div_ceil(8) as usize],
            piece_count,
        }
    }

    /// Builds a bitfield from a received `bitfield` payload.
    ///
    /// Bits beyond `piece_count` and surplus bytes are dropped; a short
    /// payload leaves the missing pieces unset.
    pub fn from_payload(payload: &[u8], piece_count: u32) -> Self {
        let mut bitfield = Self::new(piece_count);
        let copied = payload.len().min(bitfield.bits.len());
        bitfield.bits[..copied].copy_from_slice(&payload[..copied]);
        bitfield.clear_spare_bits();
        bitfield
    }

    /// Check if peer has specific piece
    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return false;
        }
        let (byte, mask) = Self::position(index);
        self.bits[byte] & mask != 0
    }

    /// Marks a piece as available. Out-of-range indices are ignored.
    pub fn set_piece(&mut self, piece_index: PieceIndex) {
        let index = piece_index.as_u32();
        if index < self.piece_count {
            let (byte, mask) = Self::position(index);
            self.bits[byte] |= mask;
        }
    }

    /// Number of pieces this bitfield covers.
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Number of pieces marked present.
    pub fn count_set(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&byte| byte == 0)
    }

    /// Indices of every piece marked present, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.piece_count)
            .map(PieceIndex::new)
            .filter(|&index| self.has_piece(index))
    }

    /// Raw packed bytes, ready for a `bitfield` message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn position(index: u32) -> (usize, u8) {
        ((index / 8) as usize, 0x80 >> (index % 8))
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() as u32 * 8 - self.piece_count;
        if spare > 0
            && let Some(last) = self.bits.last_mut()
        {
            *last &= 0xFFu8 << spare;
        }
    }
}

/// Choke/interest flags and remote availability for one connection.
///
/// Both sides start choked and uninterested.
#[derive(Debug)]
pub struct PeerConnectionState {
    /// Remote peer is choking us
    pub am_choked: bool,
    /// We told the remote peer we are interested
    pub am_interested: bool,
    /// We are choking the remote peer
    pub peer_choked: bool,
    /// Remote peer told us it is interested
    pub peer_interested: bool,
    bitfield: PeerBitfield,
}

impl PeerConnectionState {
    pub fn new(piece_count: u32) -> Self {
        Self {
            am_choked: true,
            am_interested: false,
            peer_choked: true,
            peer_interested: false,
            bitfield: PeerBitfield::new(piece_count),
        }
    }

    /// Pieces the remote peer advertised.
    pub fn bitfield(&self) -> &PeerBitfield {
        &self.bitfield
    }

    /// Applies a `have` message.
    pub fn peer_has_piece(&mut self, piece_index: PieceIndex) {
        self.bitfield.set_piece(piece_index);
    }

    /// Applies a `bitfield` message, replacing what was known.
    pub fn replace_bitfield(&mut self, payload: &[u8]) {
        self.bitfield = PeerBitfield::from_payload(payload, self.bitfield.piece_count());
    }

    /// Whether we may send requests: unchoked and interested.
    pub fn can_request(&self) -> bool {
        !self.am_choked && self.am_interested
    }
}
