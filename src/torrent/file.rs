//! Torrent file structure and parsing logic.
//!
//! This module defines the TorrentFile struct and related helpers for
//! parsing, validating, and working with .torrent file metadata.
use crate::bencode;
use crate::bencode::BencodeValue;
use crate::torrent::info_hash::InfoHash;

use super::TorrentError;
use super::TorrentResult;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Immutable view of a parsed .torrent file.
///
/// Constructed once from the raw file bytes and never mutated. The
/// info-hash is computed during parsing from the verbatim `info` slice,
/// so `TorrentFile` is the only place in the crate that ever needs the
/// original buffer.
#[derive(Debug, PartialEq, Clone)]
pub struct TorrentFile {
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<SystemTime>,
    pub comment: String,
    pub created_by: String,
    pub encoding: String,
    pub info: InfoDict,
    pub info_hash: InfoHash,
    pub pieces_hash: Vec<[u8; 20]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct InfoDict {
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub private: bool,
    pub name: String,
    pub length: Option<i64>,
    pub files: Vec<FileDict>,
    pub is_directory: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileDict {
    pub length: i64,
    pub path: Vec<String>,
}

/**
Parses the concatenated SHA-1 hashes from the `pieces` string.

# Torrent Protocol Context:
The `pieces` key within the `info` dictionary is a single byte string
that is a concatenation of 20-byte SHA-1 hashes, one per piece. This
function breaks that string into individual 20-byte arrays. The order of
the hashes corresponds directly to the piece index.
*/
#[tracing::instrument(level = "trace", skip(pieces_bytes))]
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    let num_pieces = pieces_bytes.len() / 20;
    let mut hashes = Vec::with_capacity(num_pieces);
    for chunk in pieces_bytes.chunks_exact(20) {
        let mut hash_array = [0u8; 20];
        hash_array.copy_from_slice(chunk);
        hashes.push(hash_array);
    }
    Ok(hashes)
}

fn utf8_string(bytes: Vec<u8>, field: &str) -> TorrentResult<String> {
    String::from_utf8(bytes).map_err(|e| {
        TorrentError::InvalidFormat(format!("Invalid {} (not UTF-8): {}", field, e))
    })
}

/**
Parses the announce list from the torrent file.

The value is a list of tiers, each tier an ordered list of tracker URL
strings. Tiers are tried in order; URLs within a tier are fallbacks for
each other.
*/
fn parse_announce_list(value: BencodeValue) -> TorrentResult<Vec<Vec<String>>> {
    let tiers = match value {
        BencodeValue::List(tiers) => tiers,
        _ => {
            return Err(TorrentError::InvalidFormat(
                "Announce-list not a list".to_string(),
            ))
        }
    };

    let mut result = Vec::new();
    for tier in tiers {
        let trackers = match tier {
            BencodeValue::List(trackers) => trackers,
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "Announce tier not a list".to_string(),
                ))
            }
        };
        let mut tier_vec = Vec::new();
        for tracker in trackers {
            match tracker {
                BencodeValue::String(s) => tier_vec.push(utf8_string(s, "tracker URL")?),
                _ => {
                    return Err(TorrentError::InvalidFormat(
                        "Tracker URL not a string".to_string(),
                    ))
                }
            }
        }
        result.push(tier_vec);
    }
    Ok(result)
}

/**
Parses the info dictionary from the torrent file.

# How it works:
1. Extracts `piece length`, `pieces`, `private`, `name`, `length`, and `files`.
2. Validates the structure and content of each field.
3. Enforces that exactly one of `length` (single-file) and `files`
   (multi-file) is present.
*/
fn parse_info_dict(value: BencodeValue) -> TorrentResult<InfoDict> {
    let dict = match value {
        BencodeValue::Dict(d) => d,
        _ => {
            return Err(TorrentError::InvalidFormat(
                "Info is not a dictionary".to_string(),
            ))
        }
    };

    let piece_length = match dict.get(&b"piece length".to_vec()) {
        Some(BencodeValue::Integer(i)) if *i > 0 => *i,
        _ => return Err(TorrentError::MissingField("piece length".to_string())),
    };

    let pieces_bytes = match dict.get(&b"pieces".to_vec()) {
        Some(BencodeValue::String(s)) => s.clone(),
        _ => return Err(TorrentError::MissingField("pieces".to_string())),
    };

    let private = matches!(dict.get(&b"private".to_vec()), Some(BencodeValue::Integer(1)));

    let name = match dict.get(&b"name".to_vec()) {
        Some(BencodeValue::String(s)) => utf8_string(s.clone(), "name")?,
        _ => return Err(TorrentError::MissingField("name".to_string())),
    };

    let length = match dict.get(&b"length".to_vec()) {
        Some(BencodeValue::Integer(i)) => Some(*i),
        _ => None,
    };

    let files = match dict.get(&b"files".to_vec()) {
        Some(BencodeValue::List(list)) => {
            let mut files_vec = Vec::new();
            for file_val in list {
                let file_dict = match file_val {
                    BencodeValue::Dict(d) => d,
                    _ => {
                        return Err(TorrentError::InvalidFormat(
                            "File entry not a dictionary".to_string(),
                        ))
                    }
                };

                let length = match file_dict.get(&b"length".to_vec()) {
                    Some(BencodeValue::Integer(i)) if *i >= 0 => *i,
                    _ => return Err(TorrentError::MissingField("file length".to_string())),
                };

                let path = match file_dict.get(&b"path".to_vec()) {
                    Some(BencodeValue::List(path_list)) => {
                        let mut path_vec = Vec::new();
                        for component in path_list {
                            match component {
                                BencodeValue::String(s) => {
                                    path_vec.push(utf8_string(s.clone(), "path component")?)
                                }
                                _ => {
                                    return Err(TorrentError::InvalidFormat(
                                        "Path component not a string".to_string(),
                                    ))
                                }
                            }
                        }
                        path_vec
                    }
                    _ => return Err(TorrentError::MissingField("file path".to_string())),
                };

                files_vec.push(FileDict { length, path });
            }
            Some(files_vec)
        }
        _ => None,
    };

    // Exactly one of the two modes.
    let (length, files, is_directory) = match (length, files) {
        (Some(length), None) => (Some(length), Vec::new(), false),
        (None, Some(files)) => (None, files, true),
        _ => return Err(TorrentError::AmbiguousFileMode),
    };

    Ok(InfoDict {
        piece_length,
        pieces: pieces_bytes,
        private,
        name,
        length,
        files,
        is_directory,
    })
}

impl TorrentFile {
    /**
    Parses raw .torrent bytes into a `TorrentFile`.

    # How it works:
    1. Decodes the bencoded document with span tracking.
    2. Lifts the exact byte slice of the `info` dictionary and hashes
       it for the info-hash. The parsed tree is never re-encoded for
       hashing.
    3. Extracts `announce`, `announce-list`, `creation date`, `comment`,
       `created by`, `encoding`, and the info dictionary.
    4. Validates that the declared lengths agree with the piece table.
    */
    #[tracing::instrument(level = "debug", skip(data), fields(len = data.len()))]
    pub fn from_bytes(data: &[u8]) -> TorrentResult<TorrentFile> {
        let spanned = bencode::decode_with_spans(data)?;
        let info_span = spanned
            .get(b"info")
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info_hash = InfoHash::from_info_slice(info_span.as_slice(data));
        let info = parse_info_dict(info_span.to_value())?;

        let mut dict = match spanned.to_value() {
            BencodeValue::Dict(d) => d,
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "Root is not a dictionary".to_string(),
                ))
            }
        };

        let announce = match dict.remove(&b"announce".to_vec()) {
            Some(BencodeValue::String(s)) => Some(utf8_string(s, "announce URL")?),
            Some(_) => {
                return Err(TorrentError::InvalidFormat(
                    "Announce is not a string".to_string(),
                ))
            }
            None => None,
        };

        let announce_list =
            if let Some(announce_list_value) = dict.remove(&b"announce-list".to_vec()) {
                parse_announce_list(announce_list_value)?
            } else {
                Vec::new()
            };

        let creation_date = if let Some(date_value) = dict.remove(&b"creation date".to_vec()) {
            match date_value {
                BencodeValue::Integer(timestamp) => {
                    let secs = timestamp
                        .try_into()
                        .map_err(|_| TorrentError::DateParseError)?;
                    let duration = std::time::Duration::from_secs(secs);
                    Some(UNIX_EPOCH + duration)
                }
                _ => {
                    return Err(TorrentError::InvalidFormat(
                        "Creation date not an integer".to_string(),
                    ))
                }
            }
        } else {
            None
        };

        let comment = match dict.remove(&b"comment".to_vec()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let created_by = match dict.remove(&b"created by".to_vec()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let encoding = match dict.remove(&b"encoding".to_vec()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };

        let pieces_hash = parse_pieces(&info.pieces)?;

        let torrent = TorrentFile {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            encoding,
            info,
            info_hash,
            pieces_hash,
        };
        torrent.validate_lengths()?;
        Ok(torrent)
    }

    /// Total content length in bytes across all files.
    pub fn total_length(&self) -> i64 {
        match self.info.length {
            Some(length) => length,
            None => self.info.files.iter().map(|f| f.length).sum(),
        }
    }

    /// Number of pieces, as declared by the piece hash table.
    pub fn piece_count(&self) -> usize {
        self.pieces_hash.len()
    }

    /// Size in bytes of piece `index`; every piece is `piece_length`
    /// except possibly the last.
    pub fn piece_size(&self, index: usize) -> i64 {
        let total = self.total_length();
        let piece_length = self.info.piece_length;
        if index + 1 == self.piece_count() {
            total - piece_length * index as i64
        } else {
            piece_length
        }
    }

    /// Tracker tiers in announce order. Falls back to a single tier
    /// holding `announce` when no announce-list is present.
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            return self.announce_list.clone();
        }
        match &self.announce {
            Some(url) => vec![vec![url.clone()]],
            None => Vec::new(),
        }
    }

    /// Checks total length = (N-1) * piece_length + final_piece_length
    /// with 0 < final_piece_length <= piece_length.
    fn validate_lengths(&self) -> TorrentResult<()> {
        let total = self.total_length();
        let piece_length = self.info.piece_length;
        let count = self.piece_count() as i64;

        if total < 0 {
            return Err(TorrentError::LengthMismatch(format!(
                "negative total length {total}"
            )));
        }
        if count == 0 {
            if total == 0 {
                return Ok(());
            }
            return Err(TorrentError::LengthMismatch(
                "no piece hashes for non-empty content".to_string(),
            ));
        }

        let final_piece = total - piece_length * (count - 1);
        if final_piece <= 0 || final_piece > piece_length {
            return Err(TorrentError::LengthMismatch(format!(
                "{count} pieces of {piece_length} bytes cannot cover {total} bytes"
            )));
        }
        Ok(())
    }
}
