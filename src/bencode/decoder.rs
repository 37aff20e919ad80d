use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::HashMap;
use std::ops::Range;
use tracing::instrument;

/// A decoded bencode value annotated with the byte range it occupied in
/// the source buffer.
///
/// Spans make it possible to recover the exact bytes of any sub-value
/// after decoding. The canonical use is lifting the `info` dictionary of
/// a .torrent verbatim for info-hash computation; re-serializing the
/// parsed tree silently changes the hash whenever the source used
/// non-canonical key order.
#[derive(Debug, PartialEq, Clone)]
pub struct SpannedValue {
    pub start: usize,
    pub end: usize,
    pub kind: SpannedKind,
}

#[derive(Debug, PartialEq, Clone)]
pub enum SpannedKind {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<SpannedValue>),
    Dict {
        entries: Vec<(Vec<u8>, SpannedValue)>,
        /// False when the source emitted dictionary keys out of
        /// lexicographic byte order. Tolerated on decode.
        canonical: bool,
    },
}

impl SpannedValue {
    /// The byte range this value occupied in the source buffer.
    pub fn span(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Returns the exact source bytes of this value.
    ///
    /// `source` must be the same buffer this value was decoded from.
    pub fn as_slice<'a>(&self, source: &'a [u8]) -> &'a [u8] {
        &source[self.start..self.end]
    }

    /// Looks up a dictionary entry by key. Returns None for non-dict
    /// values and missing keys.
    pub fn get(&self, key: &[u8]) -> Option<&SpannedValue> {
        match &self.kind {
            SpannedKind::Dict { entries, .. } => entries
                .iter()
                .find(|(k, _)| k.as_slice() == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Strips the span annotations, producing a plain value tree.
    pub fn to_value(&self) -> BencodeValue {
        match &self.kind {
            SpannedKind::String(s) => BencodeValue::String(s.clone()),
            SpannedKind::Integer(i) => BencodeValue::Integer(*i),
            SpannedKind::List(items) => {
                BencodeValue::List(items.iter().map(SpannedValue::to_value).collect())
            }
            SpannedKind::Dict { entries, .. } => {
                let mut dict = HashMap::with_capacity(entries.len());
                for (key, value) in entries {
                    dict.insert(key.clone(), value.to_value());
                }
                BencodeValue::Dict(dict)
            }
        }
    }
}

/// Decodes a single bencode value from the front of `bytes`.
///
/// Returns the value together with the number of bytes consumed.
/// Trailing bytes after the first complete value are not an error; the
/// caller decides whether to reject them.
#[instrument(skip(bytes), level = "debug", fields(len = bytes.len()))]
pub fn decode(bytes: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    let mut parser = Parser::new(bytes);
    let spanned = parser.decode_next()?;
    Ok((spanned.to_value(), parser.pos))
}

/// Decodes a single bencode value, keeping the byte range of every
/// sub-value so callers can slice the source buffer afterwards.
#[instrument(skip(bytes), level = "debug", fields(len = bytes.len()))]
pub fn decode_with_spans(bytes: &[u8]) -> BencodeResult<SpannedValue> {
    let mut parser = Parser::new(bytes);
    let spanned = parser.decode_next()?;
    if parser.non_canonical {
        tracing::debug!("input contains out-of-order dictionary keys");
    }
    Ok(spanned)
}

/// Positioned parser over a byte slice.
///
/// The public entry points above are thin wrappers; all grammar
/// handling lives here so that every production knows its own start and
/// end offset.
struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    non_canonical: bool,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            non_canonical: false,
        }
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEOI)
    }

    fn bump(&mut self) -> BencodeResult<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn decode_next(&mut self) -> BencodeResult<SpannedValue> {
        match self.peek()? {
            b'0'..=b'9' => self.decode_string_value(),
            b'i' => self.decode_integer(),
            b'l' => self.decode_list(),
            b'd' => self.decode_dict(),
            other => Err(BencodeError::InvalidFormat(format!(
                "Unexpected byte 0x{other:02x} at offset {}",
                self.pos
            ))),
        }
    }

    /// Decodes a byte string in the format `<length>:<data>`.
    ///
    /// The data bytes are copied out verbatim; they may contain any
    /// octet, including zero and invalid UTF-8.
    fn decode_string(&mut self) -> BencodeResult<Vec<u8>> {
        let digits_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos == digits_start {
            return Err(BencodeError::InvalidStringLength);
        }
        let length_str = std::str::from_utf8(&self.input[digits_start..self.pos])
            .map_err(|_| BencodeError::InvalidStringLength)?;
        let length = length_str
            .parse::<usize>()
            .map_err(|_| BencodeError::InvalidStringLength)?;

        if self.bump()? != b':' {
            return Err(BencodeError::InvalidStringLength);
        }
        if self.input.len() - self.pos < length {
            return Err(BencodeError::UnexpectedEOI);
        }
        let data = self.input[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(data)
    }

    fn decode_string_value(&mut self) -> BencodeResult<SpannedValue> {
        let start = self.pos;
        let data = self.decode_string()?;
        Ok(SpannedValue {
            start,
            end: self.pos,
            kind: SpannedKind::String(data),
        })
    }

    /// Decodes an integer in the format `i<number>e`.
    ///
    /// Rejected forms: empty number, leading zeros other than the
    /// literal `0`, the value `-0`, and anything outside i64 range.
    fn decode_integer(&mut self) -> BencodeResult<SpannedValue> {
        let start = self.pos;
        // caller guaranteed the 'i'
        self.bump()?;

        let digits_start = self.pos;
        loop {
            match self.bump()? {
                b'e' => break,
                b'-' | b'0'..=b'9' => continue,
                _ => return Err(BencodeError::InvalidInteger),
            }
        }
        let num_str = std::str::from_utf8(&self.input[digits_start..self.pos - 1])
            .map_err(|_| BencodeError::InvalidInteger)?;

        if num_str.is_empty() || num_str == "-0" {
            return Err(BencodeError::InvalidInteger);
        }
        if num_str.len() > 1 && num_str.starts_with('0') {
            return Err(BencodeError::InvalidInteger);
        }
        if num_str.len() > 2 && num_str.starts_with("-0") {
            return Err(BencodeError::InvalidInteger);
        }

        let value = num_str
            .parse::<i64>()
            .map_err(|_| BencodeError::InvalidInteger)?;
        Ok(SpannedValue {
            start,
            end: self.pos,
            kind: SpannedKind::Integer(value),
        })
    }

    /// Decodes a list in the format `l<values>e`.
    fn decode_list(&mut self) -> BencodeResult<SpannedValue> {
        let start = self.pos;
        self.bump()?;

        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                break;
            }
            items.push(self.decode_next()?);
        }
        Ok(SpannedValue {
            start,
            end: self.pos,
            kind: SpannedKind::List(items),
        })
    }

    /// Decodes a dictionary in the format `d(<key><value>)*e`.
    ///
    /// Keys must be byte strings. The grammar requires strictly
    /// ascending key order; violations are tolerated and recorded on
    /// the node instead of failing the parse, because real .torrent
    /// files in the wild get this wrong.
    fn decode_dict(&mut self) -> BencodeResult<SpannedValue> {
        let start = self.pos;
        self.bump()?;

        let mut entries: Vec<(Vec<u8>, SpannedValue)> = Vec::new();
        let mut canonical = true;
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                break;
            }
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::InvalidFormat(
                    "Dictionary key is not a string".to_string(),
                ));
            }
            let key = self.decode_string()?;
            if let Some((prev, _)) = entries.last() {
                if prev.as_slice() >= key.as_slice() {
                    canonical = false;
                    self.non_canonical = true;
                }
            }
            let value = self.decode_next()?;
            entries.push((key, value));
        }
        Ok(SpannedValue {
            start,
            end: self.pos,
            kind: SpannedKind::Dict { entries, canonical },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_ok(input: &[u8]) -> (BencodeValue, usize) {
        decode(input).expect("input should decode")
    }

    #[test]
    fn decodes_integers() {
        assert_eq!(decode_ok(b"i0e").0, BencodeValue::Integer(0));
        assert_eq!(decode_ok(b"i42e").0, BencodeValue::Integer(42));
        assert_eq!(decode_ok(b"i-17e").0, BencodeValue::Integer(-17));
        assert_eq!(
            decode_ok(b"i9223372036854775807e").0,
            BencodeValue::Integer(i64::MAX)
        );
        assert_eq!(
            decode_ok(b"i-9223372036854775808e").0,
            BencodeValue::Integer(i64::MIN)
        );
    }

    #[test]
    fn rejects_bad_integers() {
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"i-03e").is_err());
        assert!(decode(b"ie").is_err());
        assert!(decode(b"i12").is_err());
        assert!(decode(b"i9223372036854775808e").is_err());
    }

    #[test]
    fn decodes_strings_as_raw_bytes() {
        assert_eq!(decode_ok(b"4:spam").0, BencodeValue::String(b"spam".to_vec()));
        assert_eq!(decode_ok(b"0:").0, BencodeValue::String(Vec::new()));
        // binary contents, not UTF-8
        let (value, consumed) = decode_ok(b"3:\xc0\x00\xff");
        assert_eq!(value, BencodeValue::String(vec![0xc0, 0x00, 0xff]));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn rejects_truncated_strings() {
        assert!(decode(b"5:spam").is_err());
        assert!(decode(b"4spam").is_err());
        assert!(decode(b":spam").is_err());
    }

    #[test]
    fn decodes_empty_containers() {
        assert_eq!(decode_ok(b"le").0, BencodeValue::List(Vec::new()));
        assert_eq!(decode_ok(b"de").0, BencodeValue::Dict(HashMap::new()));
    }

    #[test]
    fn decodes_nested_values() {
        let (value, consumed) = decode_ok(b"d3:foo4:spam3:numi7ee");
        let mut expected = HashMap::new();
        expected.insert(b"foo".to_vec(), BencodeValue::String(b"spam".to_vec()));
        expected.insert(b"num".to_vec(), BencodeValue::Integer(7));
        assert_eq!(value, BencodeValue::Dict(expected));
        assert_eq!(consumed, 21);
    }

    #[test]
    fn reports_consumed_bytes_with_trailing_data() {
        let (value, consumed) = decode_ok(b"i1etrailing");
        assert_eq!(value, BencodeValue::Integer(1));
        assert_eq!(consumed, 3);
    }

    #[test]
    fn rejects_unterminated_containers() {
        assert!(decode(b"l").is_err());
        assert!(decode(b"li1e").is_err());
        assert!(decode(b"d3:foo").is_err());
    }

    #[test]
    fn rejects_non_string_dict_keys() {
        assert!(decode(b"di1ei2ee").is_err());
    }

    #[test]
    fn spans_recover_exact_source_slices() {
        let source: &[u8] = b"d8:announce3:url4:infod4:name1:x12:piece lengthi16384eee";
        let root = decode_with_spans(source).unwrap();
        let info = root.get(b"info").expect("info key present");
        assert_eq!(
            info.as_slice(source),
            &b"d4:name1:x12:piece lengthi16384ee"[..]
        );
        assert_eq!(root.span(), 0..source.len());
    }

    #[test]
    fn records_non_canonical_key_order() {
        let root = decode_with_spans(b"d1:b1:x1:a1:ye").unwrap();
        match root.kind {
            SpannedKind::Dict { canonical, .. } => assert!(!canonical),
            _ => panic!("expected dict"),
        }

        let sorted = decode_with_spans(b"d1:a1:x1:b1:ye").unwrap();
        match sorted.kind {
            SpannedKind::Dict { canonical, .. } => assert!(canonical),
            _ => panic!("expected dict"),
        }
    }
}
