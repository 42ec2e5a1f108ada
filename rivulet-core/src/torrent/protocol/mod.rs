//! BitTorrent wire protocol: message types, handshake, and framing.
//!
//! Follows BEP 3. Framing functions are generic over the byte stream so the
//! same code runs over TCP sockets and in-memory duplex pipes.

pub mod connection;
pub mod handshake;
pub mod messages;
pub mod types;

pub use connection::{accept_handshake, initiate_handshake, read_message, write_message};
pub use handshake::{HANDSHAKE_LEN, HandshakeCodec};
pub use messages::MessageCodec;
pub use types::{ConnectionState, PROTOCOL_ID, PeerHandshake, PeerId, PeerMessage};

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::torrent::{InfoHash, PieceIndex, TorrentError};

    const MAX_FRAME: u32 = 2 * 1024 * 1024 + 9;

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate("-RV0001-");
        assert_eq!(&peer_id.as_bytes()[..8], b"-RV0001-");

        let other = PeerId::generate("-RV0001-");
        assert_ne!(peer_id.as_bytes(), other.as_bytes());
        assert!(peer_id.to_string().starts_with("-RV0001-"));
    }

    #[test]
    fn test_handshake_layout() {
        let handshake = PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::new([2u8; 20]));
        let encoded = HandshakeCodec::encode(&handshake);

        assert_eq!(encoded.len(), 68);
        assert_eq!(encoded[0], 19);
        assert_eq!(&encoded[1..20], b"BitTorrent protocol");
        assert_eq!(&encoded[20..28], &[0u8; 8]);
        assert_eq!(&encoded[28..48], &[1u8; 20]);
        assert_eq!(&encoded[48..68], &[2u8; 20]);
        assert_eq!(HandshakeCodec::decode(&encoded).unwrap(), handshake);
    }

    #[test]
    fn test_handshake_rejects_other_protocols() {
        let mut encoded =
            HandshakeCodec::encode(&PeerHandshake::new(InfoHash::new([0; 20]), PeerId::new([0; 20])));
        encoded[1..20].copy_from_slice(b"BitTorrent protocoL");
        assert!(matches!(
            HandshakeCodec::decode(&encoded),
            Err(TorrentError::ProtocolError { .. })
        ));
    }

    #[test]
    fn test_message_wire_format() {
        let request = MessageCodec::encode(&PeerMessage::Request {
            piece_index: PieceIndex::new(1),
            offset: 16384,
            length: 16384,
        });
        assert_eq!(
            request.as_ref(),
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );

        let keep_alive = MessageCodec::encode(&PeerMessage::KeepAlive);
        assert_eq!(keep_alive.as_ref(), &[0, 0, 0, 0]);

        let have = MessageCodec::encode(&PeerMessage::Have {
            piece_index: PieceIndex::new(7),
        });
        assert_eq!(have.as_ref(), &[0, 0, 0, 5, 4, 0, 0, 0, 7]);
    }

    #[test]
    fn test_decode_piece_and_bitfield() {
        let piece = MessageCodec::decode(Bytes::from_static(&[7, 0, 0, 0, 2, 0, 0, 0, 0, 9, 8]))
            .unwrap();
        assert_eq!(
            piece,
            PeerMessage::Piece {
                piece_index: PieceIndex::new(2),
                offset: 0,
                data: Bytes::from_static(&[9, 8]),
            }
        );

        let bitfield = MessageCodec::decode(Bytes::from_static(&[5, 0b0000_0100])).unwrap();
        assert_eq!(
            bitfield,
            PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b0000_0100])
            }
        );
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        // Unknown id
        assert!(MessageCodec::decode(Bytes::from_static(&[20])).is_err());
        // Have with a short payload
        assert!(MessageCodec::decode(Bytes::from_static(&[4, 0, 0])).is_err());
        // Choke carrying a payload
        assert!(MessageCodec::decode(Bytes::from_static(&[0, 1])).is_err());
        // Piece missing its offset
        assert!(MessageCodec::decode(Bytes::from_static(&[7, 0, 0, 0, 1])).is_err());
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let sent = vec![
            PeerMessage::KeepAlive,
            PeerMessage::Interested,
            PeerMessage::Piece {
                piece_index: PieceIndex::new(3),
                offset: 32,
                data: Bytes::from_static(b"block"),
            },
        ];
        for message in &sent {
            write_message(&mut a, message).await.unwrap();
        }

        for expected in sent {
            assert_eq!(read_message(&mut b, MAX_FRAME).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME + 1).to_be_bytes()).await.unwrap();

        let result = read_message(&mut b, MAX_FRAME).await;
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 5, 4, 0]).await.unwrap();
        drop(a);

        assert!(matches!(
            read_message(&mut b, MAX_FRAME).await,
            Err(TorrentError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_outbound_handshake_sequence() {
        let info_hash = InfoHash::new([9u8; 20]);
        let ours = PeerHandshake::new(info_hash, PeerId::new([1u8; 20]));
        let theirs = PeerHandshake::new(info_hash, PeerId::new([2u8; 20]));

        let mut stream = tokio_test::io::Builder::new()
            .write(&HandshakeCodec::encode(&ours))
            .read(&HandshakeCodec::encode(&theirs))
            .build();

        let remote = initiate_handshake(&mut stream, &ours).await.unwrap();
        assert_eq!(remote.peer_id, PeerId::new([2u8; 20]));
    }

    #[tokio::test]
    async fn test_inbound_handshake_rejects_wrong_torrent() {
        let ours = PeerHandshake::new(InfoHash::new([9u8; 20]), PeerId::new([1u8; 20]));
        let stranger = PeerHandshake::new(InfoHash::new([8u8; 20]), PeerId::new([2u8; 20]));

        // Only a read is scripted: replying would fail the mock.
        let mut stream = tokio_test::io::Builder::new()
            .read(&HandshakeCodec::encode(&stranger))
            .build();

        let result = accept_handshake(&mut stream, &ours).await;
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_handshake_both_directions() {
        let info_hash = InfoHash::new([4u8; 20]);
        let client = PeerHandshake::new(info_hash, PeerId::new([1u8; 20]));
        let server = PeerHandshake::new(info_hash, PeerId::new([2u8; 20]));
        let (mut a, mut b) = tokio::io::duplex(256);

        let (outbound, inbound) = tokio::join!(
            initiate_handshake(&mut a, &client),
            accept_handshake(&mut b, &server)
        );
        assert_eq!(outbound.unwrap().peer_id, server.peer_id);
        assert_eq!(inbound.unwrap().peer_id, client.peer_id);
    }
}
