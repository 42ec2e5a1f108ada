//! Frame and handshake I/O over any async byte stream

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::handshake::{HANDSHAKE_LEN, HandshakeCodec};
use super::messages::MessageCodec;
use super::types::{PeerHandshake, PeerMessage};
use crate::torrent::{InfoHash, TorrentError};

/// Reads one length-prefixed message.
///
/// # Errors
///
/// - `TorrentError::ProtocolError` - If the frame exceeds `max_frame_length`
///   or fails to decode
/// - `TorrentError::Io` - If the stream fails or closes mid-frame
pub async fn read_message<R>(reader: &mut R, max_frame_length: u32) -> Result<PeerMessage, TorrentError>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_u32().await?;
    if length == 0 {
        return Ok(PeerMessage::KeepAlive);
    }
    if length > max_frame_length {
        return Err(TorrentError::protocol(format!(
            "frame of {length} bytes exceeds limit of {max_frame_length}"
        )));
    }

    let mut frame = BytesMut::zeroed(length as usize);
    reader.read_exact(&mut frame).await?;
    MessageCodec::decode(frame.freeze())
}

/// Writes one message with its length prefix.
///
/// # Errors
///
/// - `TorrentError::Io` - If the write fails
pub async fn write_message<W>(writer: &mut W, message: &PeerMessage) -> Result<(), TorrentError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&MessageCodec::encode(message)).await?;
    Ok(())
}

/// Outbound side of the handshake: send ours, then read and check theirs.
///
/// # Errors
///
/// - `TorrentError::ProtocolError` - If the reply has the wrong protocol
///   string or info hash
/// - `TorrentError::Io` - If the stream fails
pub async fn initiate_handshake<S>(
    stream: &mut S,
    ours: &PeerHandshake,
) -> Result<PeerHandshake, TorrentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&HandshakeCodec::encode(ours)).await?;
    stream.flush().await?;
    let theirs = read_handshake(stream).await?;
    check_info_hash(&theirs, &ours.info_hash)?;
    Ok(theirs)
}

/// Inbound side of the handshake: read and check theirs, then send ours.
///
/// Nothing is written when the remote handshake is rejected.
///
/// # Errors
///
/// - `TorrentError::ProtocolError` - If the remote handshake has the wrong
///   protocol string or info hash
/// - `TorrentError::Io` - If the stream fails
pub async fn accept_handshake<S>(
    stream: &mut S,
    ours: &PeerHandshake,
) -> Result<PeerHandshake, TorrentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let theirs = read_handshake(stream).await?;
    check_info_hash(&theirs, &ours.info_hash)?;
    stream.write_all(&HandshakeCodec::encode(ours)).await?;
    stream.flush().await?;
    Ok(theirs)
}

async fn read_handshake<R>(reader: &mut R) -> Result<PeerHandshake, TorrentError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut buf).await?;
    HandshakeCodec::decode(&buf)
}

fn check_info_hash(theirs: &PeerHandshake, expected: &InfoHash) -> Result<(), TorrentError> {
    if theirs.info_hash == *expected {
        Ok(())
    } else {
        Err(TorrentError::protocol(format!(
            "info hash mismatch: expected {expected}, peer sent {}",
            theirs.info_hash
        )))
    }
}
