//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It
//! verifies that both peers are participating in the same torrent (via
//! info_hash) and establishes basic protocol compatibility.
use super::{PeerError, PeerResult};
use crate::torrent::InfoHash;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

/** Represents a BitTorrent handshake message as defined in the protocol.

A handshake is the first message exchanged between peers and contains:
- Protocol identifier ("BitTorrent protocol")
- Reserved bytes for protocol extensions
- Info hash identifying the torrent
- Peer ID identifying the client */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_len: u8,
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> Self {
        Self {
            protocol_len: 19,
            protocol: *b"BitTorrent protocol",
            reserved: [0u8; 8],
            info_hash: *info_hash.as_bytes(),
            peer_id,
        }
    }

    /** Serializes the handshake into a 68-byte array.

    The serialized format is:
    - 1 byte: protocol string length (19)
    - 19 bytes: protocol string ("BitTorrent protocol")
    - 8 bytes: reserved bytes (all zeros)
    - 20 bytes: info hash
    - 20 bytes: peer ID */
    #[instrument(level = "trace")]
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = self.protocol_len;
        buf[1..20].copy_from_slice(&self.protocol);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads and validates the 68 handshake bytes from the stream.
    ///
    /// The protocol length and protocol string are checked here; the
    /// info hash is the caller's to verify because only it knows which
    /// torrent the connection is for.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut length_buf = [0u8; 1];
        stream.read_exact(&mut length_buf).await?;
        let protocol_len = length_buf[0];
        if protocol_len != 19 {
            return Err(PeerError::HandshakeInvalidProtocol);
        }

        let mut buf = [0u8; 67];
        stream.read_exact(&mut buf).await?;

        let mut protocol = [0u8; 19];
        protocol.copy_from_slice(&buf[0..19]);
        if &protocol != b"BitTorrent protocol" {
            return Err(PeerError::HandshakeInvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[19..27]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[27..47]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[47..67]);

        Ok(Self {
            protocol_len,
            protocol,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Validates that this handshake's info hash matches the expected
    /// value. A mismatch closes the connection.
    pub fn validate(&self, expected_info_hash: InfoHash) -> PeerResult<()> {
        if &self.info_hash != expected_info_hash.as_bytes() {
            return Err(PeerError::HandshakeInfoHashMismatch);
        }
        Ok(())
    }

    /// Dials a peer and performs the outbound handshake: connect, send
    /// ours, read theirs, verify the info hash. Returns the connected
    /// stream and the remote handshake.
    ///
    /// The remote peer id is recorded but not verified; its value is
    /// advisory.
    #[instrument(level = "debug", skip(info_hash, peer_id))]
    pub async fn connect(
        addr: SocketAddr,
        info_hash: InfoHash,
        peer_id: [u8; 20],
        dial_timeout: Duration,
    ) -> PeerResult<(TcpStream, Handshake)> {
        let mut stream = timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;

        let ours = Handshake::new(info_hash, peer_id);
        stream.write_all(&ours.serialize()).await?;

        let theirs = timeout(dial_timeout, Handshake::read(&mut stream))
            .await
            .map_err(|_| PeerError::Timeout)??;
        theirs.validate(info_hash)?;
        Ok((stream, theirs))
    }

    /// The inbound direction: read the remote handshake first, verify
    /// it names our torrent, then respond with ours.
    #[instrument(level = "debug", skip(stream, info_hash, peer_id))]
    pub async fn accept(
        stream: &mut TcpStream,
        info_hash: InfoHash,
        peer_id: [u8; 20],
        handshake_timeout: Duration,
    ) -> PeerResult<Handshake> {
        let theirs = timeout(handshake_timeout, Handshake::read(stream))
            .await
            .map_err(|_| PeerError::Timeout)??;
        theirs.validate(info_hash)?;

        let ours = Handshake::new(info_hash, peer_id);
        stream.write_all(&ours.serialize()).await?;
        Ok(theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn serializes_the_fixed_68_byte_layout() {
        let handshake = Handshake::new(InfoHash::from([0x01; 20]), [0x02; 20]);
        let bytes = handshake.serialize();

        let mut expected = Vec::with_capacity(68);
        expected.push(19u8);
        expected.extend_from_slice(b"BitTorrent protocol");
        expected.extend_from_slice(&[0u8; 8]);
        expected.extend_from_slice(&[0x01; 20]);
        expected.extend_from_slice(&[0x02; 20]);
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn validate_checks_the_info_hash() {
        let handshake = Handshake::new(InfoHash::from([0x01; 20]), [0x02; 20]);
        assert!(handshake.validate(InfoHash::from([0x01; 20])).is_ok());
        assert!(matches!(
            handshake.validate(InfoHash::from([0x03; 20])),
            Err(PeerError::HandshakeInfoHashMismatch)
        ));
    }

    #[tokio::test]
    async fn connect_and_accept_shake_hands() {
        let info_hash = InfoHash::from([7u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            Handshake::accept(&mut stream, info_hash, [1u8; 20], Duration::from_secs(1)).await
        });

        let (_stream, theirs) =
            Handshake::connect(addr, info_hash, [2u8; 20], Duration::from_secs(1))
                .await
                .unwrap();
        assert_eq!(theirs.peer_id, [1u8; 20]);

        let accepted = server.await.unwrap().unwrap();
        assert_eq!(accepted.peer_id, [2u8; 20]);
    }

    #[tokio::test]
    async fn wrong_info_hash_closes_within_one_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // remote answers for a different torrent
            let theirs = Handshake::read(&mut stream).await.unwrap();
            assert_eq!(theirs.info_hash, [7u8; 20]);
            let reply = Handshake::new(InfoHash::from([8u8; 20]), [1u8; 20]);
            let _ = stream.write_all(&reply.serialize()).await;
        });

        let result = Handshake::connect(
            addr,
            InfoHash::from([7u8; 20]),
            [2u8; 20],
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(PeerError::HandshakeInfoHashMismatch)));
    }
}
