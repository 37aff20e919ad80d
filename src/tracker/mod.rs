//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers, including:
//! - HTTP(S) and UDP announce requests and responses
//! - Compact peer list parsing (IPv4 and IPv6)
//! - Peer ID generation and URL encoding helpers
//!
//! Used by the session to discover peers for a torrent. Each announce is
//! self-contained; no state is shared between calls.
use crate::torrent::InfoHash;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub mod http;
pub mod udp;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Url parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Bencode deserialization error: {0}")]
    BencodeDe(#[from] serde_bencode::Error),

    #[error("Tracker rejected the announce: {0}")]
    Rejected(String),

    #[error("Announce timed out")]
    Timeout,

    #[error("Invalid tracker response: {0}")]
    InvalidResponse(String),

    #[error("Unsupported tracker URL scheme: {0}")]
    UnsupportedScheme(String),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Announce lifecycle events.
///
/// `Periodic` is the regular re-announce: signalled by omitting the
/// `event` parameter on HTTP and by the numeric value 0 on UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
    Periodic,
}

impl Event {
    /// The HTTP query value, or None when the parameter is omitted.
    pub fn http_value(&self) -> Option<&'static str> {
        match self {
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
            Event::Completed => Some("completed"),
            Event::Periodic => None,
        }
    }

    /// The numeric value used by the UDP announce packet.
    pub fn udp_value(&self) -> u32 {
        match self {
            Event::Periodic => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }
}

/// Contains the parameters for a tracker announce request.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

/// Contains the parsed response from a tracker.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub seeders: Option<i64>,
    pub leechers: Option<i64>,
    pub peers: Vec<SocketAddr>,
}

/// Sends an announce to the tracker at `url` and returns the peer list.
///
/// Dispatches on the URL scheme: `http`/`https` use a GET request,
/// `udp` uses the two-step connect/announce exchange.
#[tracing::instrument(skip(request), level = "debug", fields(event = ?request.event))]
pub async fn announce(
    url: &str,
    request: &AnnounceRequest,
    timeout: Duration,
) -> TrackerResult<AnnounceResponse> {
    let parsed = Url::parse(url)?;
    let scheme = parsed.scheme().to_string();
    match scheme.as_str() {
        "http" | "https" => http::announce(parsed, request, timeout).await,
        "udp" => udp::announce(parsed, request, timeout).await,
        _ => Err(TrackerError::UnsupportedScheme(scheme)),
    }
}

/// Generates a unique peer ID for this client.
///
/// The ID follows the Azureus convention: an 8-byte client prefix
/// ("-RE0001-") followed by 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RE0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// URL-encodes a byte slice according to RFC 3986.
///
/// Unreserved characters (a-z, A-Z, 0-9, -, ., _, ~) are left as-is,
/// every other byte becomes %XX. Applied octet-by-octet to `info_hash`
/// and `peer_id`, which are raw bytes and must never be interpreted as
/// text.
pub fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

/// Parses a compact IPv4 peer list: 6 bytes per peer, 4-byte address
/// followed by a 2-byte big-endian port.
pub fn decode_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Encodes IPv4 peers into the 6-byte compact form. Non-IPv4 addresses
/// are skipped.
pub fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        if let IpAddr::V4(ip) = peer.ip() {
            bytes.extend_from_slice(&ip.octets());
            bytes.extend_from_slice(&peer.port().to_be_bytes());
        }
    }
    bytes
}

/// Parses a compact IPv6 peer list: 18 bytes per peer, 16-byte address
/// followed by a 2-byte big-endian port.
pub fn decode_compact_peers6(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        })
        .collect()
}
