use std::collections::HashMap;
use thiserror::Error;
pub mod decoder;
pub mod encoder;

pub use decoder::{decode, decode_with_spans, SpannedValue};
pub use encoder::{encode, encode_to_bytes};

/**
 * Represents a Bencode value, the core data structure of the Bencode
 * encoding format used throughout the BitTorrent protocol.
 *
 * The enum contains four variants covering all Bencode data types:
 *
 * 1. String(Vec<u8>):
 *    - A byte string, stored as raw bytes rather than UTF-8 text
 *    - Example: "4:spam" becomes String(b"spam")
 *    - Byte strings routinely carry binary data (`pieces`, `peers`,
 *      DHT node ids), so they are never forced through a String
 *
 * 2. Integer(i64):
 *    - A 64-bit signed integer, written as "i42e"
 *
 * 3. List(Vec<BencodeValue>):
 *    - An ordered sequence, written as "l...e"
 *
 * 4. Dict(HashMap<Vec<u8>, BencodeValue>):
 *    - A mapping with byte-string keys, written as "d...e"
 *    - Keys are emitted in lexicographic byte order on encode
 */
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(HashMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    /// Returns the byte-string contents if this value is a string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer if this value is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

/// Custom error type for Bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("Invalid integer format")]
    InvalidInteger,

    #[error("Invalid string length")]
    InvalidStringLength,

    #[error("Unexpected end of input")]
    UnexpectedEOI,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
