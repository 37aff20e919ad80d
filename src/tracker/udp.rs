//! UDP tracker announce (BEP 15).
//!
//! The protocol is a two-step exchange over a connected UDP socket:
//! a 16-byte connect request yields a connection id, which authorizes a
//! 98-byte announce request. All integers are big-endian; only
//! `num_want` is signed. Lost datagrams are handled by retransmitting
//! with a doubling timeout, and every response is matched against the
//! transaction id of its request before being trusted.
use super::{
    decode_compact_peers, AnnounceRequest, AnnounceResponse, TrackerError, TrackerResult,
};
use byteorder::{BigEndian, ByteOrder};
use std::time::Duration;
use tokio::net::UdpSocket;
use url::Url;

/// Magic constant identifying the UDP tracker protocol.
const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Retransmission attempts. Attempt n waits base_timeout * 2^n.
const RETRY_ATTEMPTS: u32 = 4;

#[tracing::instrument(skip(request), level = "debug", fields(tracker = %url))]
pub(crate) async fn announce(
    url: Url,
    request: &AnnounceRequest,
    base_timeout: Duration,
) -> TrackerResult<AnnounceResponse> {
    let host = url
        .host_str()
        .ok_or_else(|| TrackerError::InvalidResponse("tracker URL has no host".to_string()))?;
    let port = url
        .port()
        .ok_or_else(|| TrackerError::InvalidResponse("tracker URL has no port".to_string()))?;

    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    let addr = addrs
        .next()
        .ok_or_else(|| TrackerError::InvalidResponse(format!("{host} did not resolve")))?;

    let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;

    let connection_id = connect(&socket, base_timeout).await?;
    announce_with_connection(&socket, connection_id, request, base_timeout).await
}

/// Step one: obtain a connection id.
async fn connect(socket: &UdpSocket, base_timeout: Duration) -> TrackerResult<u64> {
    for attempt in 0..RETRY_ATTEMPTS {
        let transaction_id = rand::random::<u32>();
        let packet = build_connect_request(transaction_id);
        let window = base_timeout * 2u32.pow(attempt);
        if let Some(datagram) = exchange(socket, &packet, window, transaction_id).await? {
            return parse_connect_response(&datagram, transaction_id);
        }
        tracing::debug!(attempt, "connect request timed out, retransmitting");
    }
    Err(TrackerError::Timeout)
}

/// Step two: announce under the connection id from step one.
async fn announce_with_connection(
    socket: &UdpSocket,
    connection_id: u64,
    request: &AnnounceRequest,
    base_timeout: Duration,
) -> TrackerResult<AnnounceResponse> {
    for attempt in 0..RETRY_ATTEMPTS {
        let transaction_id = rand::random::<u32>();
        let key = rand::random::<u32>();
        let packet = build_announce_request(connection_id, transaction_id, key, request);
        let window = base_timeout * 2u32.pow(attempt);
        if let Some(datagram) = exchange(socket, &packet, window, transaction_id).await? {
            return parse_announce_response(&datagram, transaction_id);
        }
        tracing::debug!(attempt, "announce request timed out, retransmitting");
    }
    Err(TrackerError::Timeout)
}

/// Sends `packet` and waits up to `window` for a datagram whose echoed
/// transaction id matches. Mismatched datagrams are discarded without
/// consuming the window. Returns None when the window elapses.
async fn exchange(
    socket: &UdpSocket,
    packet: &[u8],
    window: Duration,
    transaction_id: u32,
) -> TrackerResult<Option<Vec<u8>>> {
    socket.send(packet).await?;
    let wait = tokio::time::timeout(window, async {
        let mut buf = [0u8; 2048];
        loop {
            let len = socket.recv(&mut buf).await?;
            if len >= 8 && BigEndian::read_u32(&buf[4..8]) == transaction_id {
                return Ok::<Vec<u8>, TrackerError>(buf[..len].to_vec());
            }
            tracing::trace!(len, "discarding datagram with foreign transaction id");
        }
    })
    .await;
    match wait {
        Ok(Ok(datagram)) => Ok(Some(datagram)),
        Ok(Err(e)) => Err(e),
        Err(_elapsed) => Ok(None),
    }
}

pub(crate) fn build_connect_request(transaction_id: u32) -> [u8; 16] {
    let mut packet = [0u8; 16];
    BigEndian::write_u64(&mut packet[0..8], PROTOCOL_ID);
    BigEndian::write_u32(&mut packet[8..12], ACTION_CONNECT);
    BigEndian::write_u32(&mut packet[12..16], transaction_id);
    packet
}

pub(crate) fn parse_connect_response(datagram: &[u8], transaction_id: u32) -> TrackerResult<u64> {
    if datagram.len() < 16 {
        return Err(TrackerError::InvalidResponse(format!(
            "connect response too short: {} bytes",
            datagram.len()
        )));
    }
    let action = BigEndian::read_u32(&datagram[0..4]);
    if BigEndian::read_u32(&datagram[4..8]) != transaction_id {
        return Err(TrackerError::InvalidResponse(
            "transaction id mismatch".to_string(),
        ));
    }
    match action {
        ACTION_CONNECT => Ok(BigEndian::read_u64(&datagram[8..16])),
        ACTION_ERROR => Err(error_from_datagram(datagram)),
        other => Err(TrackerError::InvalidResponse(format!(
            "unexpected action {other} in connect response"
        ))),
    }
}

/// Builds the fixed 98-byte announce packet.
pub(crate) fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    request: &AnnounceRequest,
) -> [u8; 98] {
    let mut packet = [0u8; 98];
    BigEndian::write_u64(&mut packet[0..8], connection_id);
    BigEndian::write_u32(&mut packet[8..12], ACTION_ANNOUNCE);
    BigEndian::write_u32(&mut packet[12..16], transaction_id);
    packet[16..36].copy_from_slice(request.info_hash.as_bytes());
    packet[36..56].copy_from_slice(&request.peer_id);
    BigEndian::write_u64(&mut packet[56..64], request.downloaded);
    BigEndian::write_u64(&mut packet[64..72], request.left);
    BigEndian::write_u64(&mut packet[72..80], request.uploaded);
    BigEndian::write_u32(&mut packet[80..84], request.event.udp_value());
    // ip stays 0: the tracker uses the sender address
    BigEndian::write_u32(&mut packet[88..92], key);
    BigEndian::write_i32(&mut packet[92..96], -1); // num_want: tracker default
    BigEndian::write_u16(&mut packet[96..98], request.port);
    packet
}

pub(crate) fn parse_announce_response(
    datagram: &[u8],
    transaction_id: u32,
) -> TrackerResult<AnnounceResponse> {
    if datagram.len() < 8 {
        return Err(TrackerError::InvalidResponse(format!(
            "announce response too short: {} bytes",
            datagram.len()
        )));
    }
    let action = BigEndian::read_u32(&datagram[0..4]);
    if BigEndian::read_u32(&datagram[4..8]) != transaction_id {
        return Err(TrackerError::InvalidResponse(
            "transaction id mismatch".to_string(),
        ));
    }
    if action == ACTION_ERROR {
        return Err(error_from_datagram(datagram));
    }
    if action != ACTION_ANNOUNCE || datagram.len() < 20 {
        return Err(TrackerError::InvalidResponse(format!(
            "unexpected announce response: action {action}, {} bytes",
            datagram.len()
        )));
    }

    let interval = BigEndian::read_u32(&datagram[8..12]);
    let leechers = BigEndian::read_u32(&datagram[12..16]);
    let seeders = BigEndian::read_u32(&datagram[16..20]);
    let peers = decode_compact_peers(&datagram[20..]);

    Ok(AnnounceResponse {
        interval: Duration::from_secs(u64::from(interval.max(1))),
        min_interval: None,
        seeders: Some(i64::from(seeders)),
        leechers: Some(i64::from(leechers)),
        peers,
    })
}

/// Action 3 carries a UTF-8 error message after the 8-byte header.
fn error_from_datagram(datagram: &[u8]) -> TrackerError {
    let message = String::from_utf8_lossy(&datagram[8..]).into_owned();
    TrackerError::Rejected(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::InfoHash;
    use crate::tracker::Event;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::from([0x11; 20]),
            peer_id: *b"-RE0001-abcdefghijkl",
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event: Event::Started,
        }
    }

    #[test]
    fn connect_request_layout() {
        let packet = build_connect_request(0xDEADBEEF);
        assert_eq!(&packet[0..8], &0x41727101980u64.to_be_bytes());
        assert_eq!(&packet[8..12], &[0, 0, 0, 0]);
        assert_eq!(&packet[12..16], &0xDEADBEEFu32.to_be_bytes());
    }

    #[test]
    fn connect_response_yields_connection_id() {
        let mut datagram = [0u8; 16];
        BigEndian::write_u32(&mut datagram[4..8], 0xDEADBEEF);
        BigEndian::write_u64(&mut datagram[8..16], 0x1122334455667788);
        assert_eq!(
            parse_connect_response(&datagram, 0xDEADBEEF).unwrap(),
            0x1122334455667788
        );
    }

    #[test]
    fn connect_response_transaction_mismatch_is_rejected() {
        let mut datagram = [0u8; 16];
        BigEndian::write_u32(&mut datagram[4..8], 1);
        assert!(parse_connect_response(&datagram, 2).is_err());
    }

    #[test]
    fn announce_request_layout() {
        let packet = build_announce_request(0xAABB, 7, 9, &request());
        assert_eq!(BigEndian::read_u64(&packet[0..8]), 0xAABB);
        assert_eq!(BigEndian::read_u32(&packet[8..12]), ACTION_ANNOUNCE);
        assert_eq!(BigEndian::read_u32(&packet[12..16]), 7);
        assert_eq!(&packet[16..36], &[0x11; 20]);
        assert_eq!(&packet[36..56], b"-RE0001-abcdefghijkl");
        assert_eq!(BigEndian::read_u64(&packet[56..64]), 2); // downloaded
        assert_eq!(BigEndian::read_u64(&packet[64..72]), 3); // left
        assert_eq!(BigEndian::read_u64(&packet[72..80]), 1); // uploaded
        assert_eq!(BigEndian::read_u32(&packet[80..84]), 2); // started
        assert_eq!(BigEndian::read_u32(&packet[84..88]), 0); // ip
        assert_eq!(BigEndian::read_u32(&packet[88..92]), 9); // key
        assert_eq!(BigEndian::read_i32(&packet[92..96]), -1); // num_want
        assert_eq!(BigEndian::read_u16(&packet[96..98]), 6881);
    }

    #[test]
    fn announce_response_with_peers() {
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        datagram.extend_from_slice(&42u32.to_be_bytes());
        datagram.extend_from_slice(&1800u32.to_be_bytes());
        datagram.extend_from_slice(&3u32.to_be_bytes());
        datagram.extend_from_slice(&5u32.to_be_bytes());
        datagram.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);

        let response = parse_announce_response(&datagram, 42).unwrap();
        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.leechers, Some(3));
        assert_eq!(response.seeders, Some(5));
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn error_action_surfaces_the_message() {
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&ACTION_ERROR.to_be_bytes());
        datagram.extend_from_slice(&42u32.to_be_bytes());
        datagram.extend_from_slice(b"torrent not registered");
        match parse_announce_response(&datagram, 42) {
            Err(TrackerError::Rejected(message)) => {
                assert_eq!(message, "torrent not registered")
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    /// Loopback fixture speaking just enough of the tracker side.
    async fn fake_tracker(behaviour: fn(&[u8]) -> Vec<Vec<u8>>) -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                for reply in behaviour(&buf[..len]) {
                    socket.send_to(&reply, from).await.unwrap();
                }
            }
        });
        addr
    }

    fn tracker_behaviour(datagram: &[u8]) -> Vec<Vec<u8>> {
        let action = BigEndian::read_u32(&datagram[8..12]);
        let transaction_id = BigEndian::read_u32(&datagram[12..16]);
        if action == ACTION_CONNECT {
            assert_eq!(BigEndian::read_u64(&datagram[0..8]), PROTOCOL_ID);
            let mut reply = [0u8; 16];
            BigEndian::write_u32(&mut reply[4..8], transaction_id);
            BigEndian::write_u64(&mut reply[8..16], 0xC0FFEE);
            vec![reply.to_vec()]
        } else {
            assert_eq!(BigEndian::read_u64(&datagram[0..8]), 0xC0FFEE);
            assert_eq!(action, ACTION_ANNOUNCE);
            assert_eq!(datagram.len(), 98);
            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
            reply.extend_from_slice(&transaction_id.to_be_bytes());
            reply.extend_from_slice(&900u32.to_be_bytes());
            reply.extend_from_slice(&1u32.to_be_bytes());
            reply.extend_from_slice(&2u32.to_be_bytes());
            reply.extend_from_slice(&[10, 0, 0, 7, 0x1a, 0xe1]);
            vec![reply]
        }
    }

    #[tokio::test]
    async fn full_exchange_against_loopback_tracker() {
        let addr = fake_tracker(tracker_behaviour).await;
        let url = Url::parse(&format!("udp://{addr}")).unwrap();
        let response = announce(url, &request(), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(response.interval, Duration::from_secs(900));
        assert_eq!(response.peers, vec!["10.0.0.7:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn foreign_transaction_ids_are_discarded() {
        fn behaviour(datagram: &[u8]) -> Vec<Vec<u8>> {
            let transaction_id = BigEndian::read_u32(&datagram[12..16]);
            let action = BigEndian::read_u32(&datagram[8..12]);
            if action == ACTION_CONNECT {
                // a stray datagram first, then the genuine response
                let mut stray = [0u8; 16];
                BigEndian::write_u32(&mut stray[4..8], transaction_id.wrapping_add(1));
                let mut reply = [0u8; 16];
                BigEndian::write_u32(&mut reply[4..8], transaction_id);
                BigEndian::write_u64(&mut reply[8..16], 0xC0FFEE);
                vec![stray.to_vec(), reply.to_vec()]
            } else {
                tracker_behaviour(datagram)
            }
        }
        let addr = fake_tracker(behaviour).await;
        let url = Url::parse(&format!("udp://{addr}")).unwrap();
        let response = announce(url, &request(), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(response.peers.len(), 1);
    }

    #[tokio::test]
    async fn silent_tracker_times_out() {
        // bound but never reads: all retransmissions expire
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("udp://{}", socket.local_addr().unwrap())).unwrap();
        let result = announce(url, &request(), Duration::from_millis(5)).await;
        assert!(matches!(result, Err(TrackerError::Timeout)));
    }
}
