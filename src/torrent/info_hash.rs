use sha1::Digest;
use sha1::Sha1;
use std::fmt;

/// The 20-byte SHA-1 of a torrent's bencoded `info` dictionary; the
/// content-addressing identity of the torrent.
///
/// The hash is always computed over the exact byte slice of `info` as it
/// appeared in the source file. Re-encoding the parsed tree and hashing
/// that is not equivalent: a source with non-canonical key order would
/// produce a different digest and the torrent would silently become
/// unfindable on trackers and the DHT.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Hashes the verbatim bencoded `info` slice lifted from a .torrent.
    pub fn from_info_slice(info: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(info);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        InfoHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex rendering, as shown in status output and logs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(bytes: [u8; 20]) -> Self {
        InfoHash(bytes)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_the_exact_slice() {
        let info = b"d4:name1:x12:piece lengthi16384e6:pieces0:e";
        let hash = InfoHash::from_info_slice(info);

        let mut hasher = Sha1::new();
        hasher.update(info);
        assert_eq!(hash.as_bytes()[..], hasher.finalize()[..]);
    }

    #[test]
    fn renders_lowercase_hex() {
        let hash = InfoHash::from([0xAB; 20]);
        assert_eq!(hash.to_hex(), "ab".repeat(20));
        assert_eq!(format!("{hash}"), "ab".repeat(20));
    }
}
