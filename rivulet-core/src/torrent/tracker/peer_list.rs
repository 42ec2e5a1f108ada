//! Tracker peer list decoding: compact IPv4, compact IPv6, and dictionary lists

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::torrent::TorrentError;

const COMPACT_V4_LEN: usize = 6;
const COMPACT_V6_LEN: usize = 18;

/// Decodes the `peers` value of an announce response.
///
/// Accepts either a compact blob of 6-byte records or a list of
/// dictionaries with `ip` and `port` keys. Dictionary entries with an
/// unparsable address are skipped.
///
/// # Errors
///
/// - `TorrentError::ProtocolError` - Compact blob length is not a multiple
///   of 6, or the value has another type
pub fn decode_peer_list(value: &bencode_rs::Value<'_>) -> Result<Vec<SocketAddr>, TorrentError> {
    match value {
        bencode_rs::Value::Bytes(blob) => decode_compact_v4(blob),
        bencode_rs::Value::List(entries) => Ok(entries.iter().filter_map(decode_peer_dict).collect()),
        _ => Err(TorrentError::protocol("peers must be a string or a list")),
    }
}

/// Decodes 6-byte records: IPv4 address then big-endian port.
///
/// # Errors
///
/// - `TorrentError::ProtocolError` - Length is not a multiple of 6
pub fn decode_compact_v4(blob: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
    if !blob.len().is_multiple_of(COMPACT_V4_LEN) {
        return Err(TorrentError::protocol(format!(
            "compact peer list of {} bytes",
            blob.len()
        )));
    }

    Ok(blob
        .chunks_exact(COMPACT_V4_LEN)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([chunk[4], chunk[5]]))
        })
        .collect())
}

/// Decodes 18-byte records: IPv6 address then big-endian port.
///
/// # Errors
///
/// - `TorrentError::ProtocolError` - Length is not a multiple of 18
pub fn decode_compact_v6(blob: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
    if !blob.len().is_multiple_of(COMPACT_V6_LEN) {
        return Err(TorrentError::protocol(format!(
            "compact peers6 list of {} bytes",
            blob.len()
        )));
    }

    Ok(blob
        .chunks_exact(COMPACT_V6_LEN)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        })
        .collect())
}

fn decode_peer_dict(entry: &bencode_rs::Value<'_>) -> Option<SocketAddr> {
    let bencode_rs::Value::Dictionary(dict) = entry else {
        return None;
    };
    let Some(bencode_rs::Value::Bytes(ip)) = dict.get(b"ip".as_slice()) else {
        return None;
    };
    let Some(bencode_rs::Value::Integer(port)) = dict.get(b"port".as_slice()) else {
        return None;
    };

    let ip: IpAddr = std::str::from_utf8(ip).ok()?.parse().ok()?;
    let port = u16::try_from(*port).ok()?;
    Some(SocketAddr::new(ip, port))
}
