use super::BencodeResult;
use super::BencodeValue;
use std::collections::HashMap;
use std::io::Write;
use tracing::instrument;

#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// Encodes a dictionary with its keys in lexicographic byte order.
///
/// The backing HashMap has no order of its own, so the keys are sorted
/// on every encode. This is what makes `encode` deterministic.
#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(
    writer: &mut W,
    dict: &HashMap<Vec<u8>, BencodeValue>,
) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    let mut keys: Vec<&Vec<u8>> = dict.keys().collect();
    keys.sort_unstable();
    for key in keys {
        encode_string(writer, key)?;
        // key came out of the map above
        let value = &dict[key];
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes a value into the given writer.
#[instrument(skip(writer, value), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Encodes a value into a fresh byte buffer.
pub fn encode_to_bytes(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buffer = Vec::new();
    encode(&mut buffer, value)?;
    Ok(buffer)
}
