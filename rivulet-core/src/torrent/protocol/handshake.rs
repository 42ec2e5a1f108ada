//! BitTorrent handshake encoding and decoding

use super::types::{PROTOCOL_ID, PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Size of a BEP 3 handshake: pstrlen, pstr, reserved, info hash, peer id.
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// Handshake serialization for the BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Encodes a handshake into its fixed 68-byte form.
    pub fn encode(handshake: &PeerHandshake) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_ID.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_ID);
        buf[20..28].copy_from_slice(&handshake.reserved);
        buf[28..48].copy_from_slice(handshake.info_hash.as_bytes());
        buf[48..68].copy_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Decodes a 68-byte handshake.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ProtocolError` - If the protocol string is not
    ///   "BitTorrent protocol"
    pub fn decode(data: &[u8; HANDSHAKE_LEN]) -> Result<PeerHandshake, TorrentError> {
        if usize::from(data[0]) != PROTOCOL_ID.len() || &data[1..20] != PROTOCOL_ID {
            return Err(TorrentError::protocol(format!(
                "unexpected protocol string {:?}",
                String::from_utf8_lossy(&data[1..20])
            )));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(PeerHandshake {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}
