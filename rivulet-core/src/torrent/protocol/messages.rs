//! BitTorrent wire protocol message encoding and decoding

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::super::{PieceIndex, TorrentError};
use super::types::PeerMessage;

/// Message serialization for the BitTorrent wire protocol.
///
/// Frames are `[u32 big-endian length][id][payload]`; a zero length is a
/// keep-alive.
pub struct MessageCodec;

impl MessageCodec {
    /// Encodes a message including its length prefix.
    pub fn encode(message: &PeerMessage) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::encoded_len(message));

        match message {
            PeerMessage::KeepAlive => buf.put_u32(0),
            PeerMessage::Choke => Self::put_header(&mut buf, 1, 0),
            PeerMessage::Unchoke => Self::put_header(&mut buf, 1, 1),
            PeerMessage::Interested => Self::put_header(&mut buf, 1, 2),
            PeerMessage::NotInterested => Self::put_header(&mut buf, 1, 3),
            PeerMessage::Have { piece_index } => {
                Self::put_header(&mut buf, 5, 4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                Self::put_header(&mut buf, 1 + bitfield.len() as u32, 5);
                buf.put_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                Self::put_header(&mut buf, 13, 6);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                Self::put_header(&mut buf, 9 + data.len() as u32, 7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                Self::put_header(&mut buf, 13, 8);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                Self::put_header(&mut buf, 3, 9);
                buf.put_u16(*port);
            }
        }

        buf.freeze()
    }

    /// Decodes a frame body (everything after the length prefix).
    ///
    /// # Errors
    ///
    /// - `TorrentError::ProtocolError` - If the id is unknown or the payload
    ///   length does not match the message type
    pub fn decode(mut frame: Bytes) -> Result<PeerMessage, TorrentError> {
        if frame.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let id = frame.get_u8();
        let payload_len = frame.len();
        let expect = |expected: usize, name: &str| {
            if payload_len == expected {
                Ok(())
            } else {
                Err(TorrentError::protocol(format!(
                    "{name} payload is {payload_len} bytes, expected {expected}"
                )))
            }
        };

        match id {
            0 => expect(0, "choke").map(|_| PeerMessage::Choke),
            1 => expect(0, "unchoke").map(|_| PeerMessage::Unchoke),
            2 => expect(0, "interested").map(|_| PeerMessage::Interested),
            3 => expect(0, "not-interested").map(|_| PeerMessage::NotInterested),
            4 => {
                expect(4, "have")?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(frame.get_u32()),
                })
            }
            5 => Ok(PeerMessage::Bitfield { bitfield: frame }),
            6 | 8 => {
                expect(12, if id == 6 { "request" } else { "cancel" })?;
                let piece_index = PieceIndex::new(frame.get_u32());
                let offset = frame.get_u32();
                let length = frame.get_u32();
                Ok(if id == 6 {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                })
            }
            7 => {
                if payload_len < 8 {
                    return Err(TorrentError::protocol(format!(
                        "piece payload is {payload_len} bytes, expected at least 8"
                    )));
                }
                let piece_index = PieceIndex::new(frame.get_u32());
                let offset = frame.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: frame,
                })
            }
            9 => {
                expect(2, "port")?;
                Ok(PeerMessage::Port {
                    port: frame.get_u16(),
                })
            }
            other => Err(TorrentError::protocol(format!(
                "unknown message id {other}"
            ))),
        }
    }

    fn put_header(buf: &mut BytesMut, length: u32, id: u8) {
        buf.put_u32(length);
        buf.put_u8(id);
    }

    fn encoded_len(message: &PeerMessage) -> usize {
        4 + match message {
            PeerMessage::KeepAlive => 0,
            PeerMessage::Bitfield { bitfield } => 1 + bitfield.len(),
            PeerMessage::Piece { data, .. } => 9 + data.len(),
            PeerMessage::Have { .. } => 5,
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => 13,
            PeerMessage::Port { .. } => 3,
            _ => 1,
        }
    }
}
