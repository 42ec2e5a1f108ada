//! Bencode field extraction and info hash calculation

use std::collections::HashMap;
use std::ops::Range;

use sha1::{Digest, Sha1};

use super::types::{TorrentFile, TorrentMetadata};
use crate::torrent::{InfoHash, TorrentError};

type BencodeDict<'a> = HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;

/// Bencode helpers for torrent metadata extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Parses a complete `.torrent` document.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If decoding fails, a required
    ///   field is missing or mistyped, or the piece geometry is inconsistent
    pub fn parse_bencode_data(torrent_bytes: &[u8]) -> ParseResult<TorrentMetadata> {
        let parsed = bencode_rs::Value::parse(torrent_bytes)
            .map_err(|e| invalid(format!("bencode decoding failed: {e:?}")))?;

        let Some(bencode_rs::Value::Dictionary(root)) = parsed.first() else {
            return Err(invalid("root element must be a dictionary"));
        };
        let Some(bencode_rs::Value::Dictionary(info)) = root.get(b"info".as_slice()) else {
            return Err(invalid("missing or invalid 'info' dictionary"));
        };

        let info_span = Self::info_span(torrent_bytes)?;
        let digest = Sha1::digest(&torrent_bytes[info_span]);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);

        let name = Self::extract_string(info, b"name")?;
        let piece_length = u32::try_from(Self::extract_integer(info, b"piece length")?)
            .ok()
            .filter(|&length| length > 0)
            .ok_or_else(|| invalid("'piece length' must be a positive 32-bit value"))?;

        let pieces = Self::extract_bytes(info, b"pieces")?;
        if pieces.is_empty() || !pieces.len().is_multiple_of(20) {
            return Err(invalid(format!(
                "'pieces' is {} bytes, expected a non-zero multiple of 20",
                pieces.len()
            )));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = match (info.get(b"length".as_slice()), info.get(b"files".as_slice())) {
            (Some(_), _) => vec![TorrentFile {
                path: vec![name.clone()],
                length: Self::extract_length(info)?,
            }],
            (None, Some(bencode_rs::Value::List(entries))) => Self::extract_files(&name, entries)?,
            _ => return Err(invalid("info needs either 'length' or a 'files' list")),
        };
        let total_length: u64 = files.iter().map(|file| file.length).sum();
        if total_length == 0 {
            return Err(invalid("torrent has no content"));
        }

        let expected_pieces = total_length.div_ceil(u64::from(piece_length));
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(invalid(format!(
                "{total_length} bytes in pieces of {piece_length} needs {expected_pieces} hashes, found {}",
                piece_hashes.len()
            )));
        }

        Ok(TorrentMetadata {
            info_hash: InfoHash::new(hash),
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
            announce_urls: Self::extract_announce_urls(root),
        })
    }

    /// Byte range of the top-level `info` value.
    ///
    /// Walks the root dictionary key by key, so an `info` key nested
    /// elsewhere, or the text `4:info` inside a string, is never mistaken
    /// for it.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the root is not a
    ///   well-formed dictionary or has no `info` key
    pub fn info_span(data: &[u8]) -> ParseResult<Range<usize>> {
        if data.first() != Some(&b'd') {
            return Err(invalid("expected dictionary start"));
        }

        let mut pos = 1;
        loop {
            match data.get(pos) {
                None => return Err(invalid("unterminated root dictionary")),
                Some(b'e') => return Err(invalid("missing 'info' field")),
                Some(_) => {}
            }

            let key = Self::string_bounds(data, pos)?;
            let value_start = key.end;
            let value_end = Self::value_end(data, value_start)?;
            if &data[key] == b"info" {
                return Ok(value_start..value_end);
            }
            pos = value_end;
        }
    }

    /// Offset one past the bencoded value starting at `start`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the value is malformed or truncated
    pub fn value_end(data: &[u8], start: usize) -> ParseResult<usize> {
        let mut pos = start;
        let mut depth = 0usize;

        loop {
            let byte = *data.get(pos).ok_or_else(|| invalid("truncated bencode value"))?;
            match byte {
                b'd' | b'l' => {
                    depth += 1;
                    pos += 1;
                    continue;
                }
                b'e' if depth > 0 => {
                    depth -= 1;
                    pos += 1;
                }
                b'i' => {
                    let close = data[pos..]
                        .iter()
                        .position(|&b| b == b'e')
                        .ok_or_else(|| invalid("unterminated integer"))?;
                    pos += close + 1;
                }
                b'0'..=b'9' => pos = Self::string_bounds(data, pos)?.end,
                other => {
                    return Err(invalid(format!(
                        "unexpected byte {other:#04x} at offset {pos}"
                    )));
                }
            }

            if depth == 0 {
                return Ok(pos);
            }
        }
    }

    /// Content range of the byte string starting at `start`.
    fn string_bounds(data: &[u8], start: usize) -> ParseResult<Range<usize>> {
        let colon = data[start..]
            .iter()
            .position(|&b| b == b':')
            .map(|offset| start + offset)
            .ok_or_else(|| invalid("unterminated string length"))?;

        let length: usize = std::str::from_utf8(&data[start..colon])
            .ok()
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| invalid("invalid string length"))?;

        let content_start = colon + 1;
        let content_end = content_start
            .checked_add(length)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| invalid("string runs past end of data"))?;
        Ok(content_start..content_end)
    }

    fn extract_files(name: &str, entries: &[bencode_rs::Value<'_>]) -> ParseResult<Vec<TorrentFile>> {
        if entries.is_empty() {
            return Err(invalid("'files' list is empty"));
        }

        entries
            .iter()
            .map(|entry| {
                let bencode_rs::Value::Dictionary(file) = entry else {
                    return Err(invalid("file entry must be a dictionary"));
                };
                let length = Self::extract_length(file)?;
                let Some(bencode_rs::Value::List(components)) = file.get(b"path".as_slice()) else {
                    return Err(invalid("file entry missing 'path' list"));
                };
                if components.is_empty() {
                    return Err(invalid("file entry has an empty path"));
                }

                let mut path = Vec::with_capacity(components.len() + 1);
                path.push(name.to_string());
                for component in components {
                    let bencode_rs::Value::Bytes(raw) = component else {
                        return Err(invalid("path component must be a string"));
                    };
                    let component = std::str::from_utf8(raw)
                        .map_err(|_| invalid("invalid UTF-8 in file path"))?;
                    path.push(component.to_string());
                }

                Ok(TorrentFile { path, length })
            })
            .collect()
    }

    fn extract_announce_urls(root: &BencodeDict<'_>) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let mut push = |raw: &[u8]| {
            if let Ok(url) = std::str::from_utf8(raw)
                && !url.is_empty()
                && !urls.iter().any(|known| known == url)
            {
                urls.push(url.to_string());
            }
        };

        if let Some(bencode_rs::Value::Bytes(announce)) = root.get(b"announce".as_slice()) {
            push(&announce[..]);
        }
        if let Some(bencode_rs::Value::List(tiers)) = root.get(b"announce-list".as_slice()) {
            for tier in tiers {
                if let bencode_rs::Value::List(tier) = tier {
                    for url in tier {
                        if let bencode_rs::Value::Bytes(url) = url {
                            push(&url[..]);
                        }
                    }
                }
            }
        }

        urls
    }

    fn extract_length(dict: &BencodeDict<'_>) -> ParseResult<u64> {
        u64::try_from(Self::extract_integer(dict, b"length")?)
            .map_err(|_| invalid("negative file length"))
    }

    fn extract_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| invalid(format!("invalid UTF-8 in '{}'", String::from_utf8_lossy(key))))
    }

    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(invalid(format!(
                "missing or invalid field '{}'",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(invalid(format!(
                "missing or invalid integer '{}'",
                String::from_utf8_lossy(key)
            ))),
        }
    }
}

fn invalid(reason: impl Into<String>) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.into(),
    }
}
