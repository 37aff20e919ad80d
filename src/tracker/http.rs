//! HTTP(S) tracker announce.
//!
//! The announce is a GET request with the parameters URL-encoded into the
//! query string. The query is assembled by hand because `info_hash` and
//! `peer_id` are raw octets that must be percent-encoded byte-by-byte;
//! generic form encoders would re-encode the percent signs.
use super::{
    decode_compact_peers, decode_compact_peers6, url_encode, AnnounceRequest, AnnounceResponse,
    TrackerError, TrackerResult,
};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use url::Url;

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(rename = "min interval", default)]
    min_interval: Option<i64>,
    #[serde(default)]
    complete: Option<i64>,
    #[serde(default)]
    incomplete: Option<i64>,
    #[serde(default)]
    peers: Option<RawPeers>,
    #[serde(default)]
    peers6: Option<ByteBuf>,
}

/// Trackers answer with either the compact byte-string form or a list
/// of peer dictionaries; some emit the compact bytes with a string
/// type, which `ByteBuf` absorbs either way.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPeers {
    Compact(ByteBuf),
    NonCompact(Vec<PeerDict>),
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

/// Sends an announce request to the tracker to get a list of peers.
#[tracing::instrument(skip(request), level = "debug", fields(tracker = %url))]
pub(crate) async fn announce(
    mut url: Url,
    request: &AnnounceRequest,
    timeout: Duration,
) -> TrackerResult<AnnounceResponse> {
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        url_encode(request.info_hash.as_bytes()),
        url_encode(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
    );
    if let Some(event) = request.event.http_value() {
        query.push_str("&event=");
        query.push_str(event);
    }
    if let Some(existing) = url.query() {
        query = format!("{existing}&{query}");
    }
    url.set_query(Some(&query));

    tracing::debug!(%url, "Making announce request to tracker");
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("rs-torrent-engine/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            TrackerError::Timeout
        } else {
            TrackerError::HttpRequest(e)
        }
    })?;
    let response_bytes = response.bytes().await?;
    parse_announce_response(&response_bytes)
}

/// Parses the bencoded response body of an HTTP announce.
///
/// A `failure reason` key marks a rejection and takes priority over
/// everything else. Success responses carry `interval`, optional
/// seeder/leecher counts, a `peers` field in compact or dictionary
/// form, and optionally a compact `peers6` field.
pub(crate) fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    let raw: RawResponse = serde_bencode::from_bytes(bytes)?;

    if let Some(reason) = raw.failure_reason {
        return Err(TrackerError::Rejected(reason));
    }

    let interval = match raw.interval {
        Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
        _ => {
            return Err(TrackerError::InvalidResponse(
                "missing or non-positive interval".to_string(),
            ))
        }
    };

    let mut peers = match raw.peers {
        Some(RawPeers::Compact(bytes)) => decode_compact_peers(&bytes),
        Some(RawPeers::NonCompact(dicts)) => dicts
            .into_iter()
            .filter_map(|dict| {
                dict.ip
                    .parse::<IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, dict.port))
            })
            .collect(),
        None => Vec::new(),
    };
    if let Some(peers6) = raw.peers6 {
        peers.extend(decode_compact_peers6(&peers6));
    }

    Ok(AnnounceResponse {
        interval,
        min_interval: raw
            .min_interval
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64)),
        seeders: raw.complete,
        leechers: raw.incomplete,
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peers() {
        let body = b"d8:intervali1800e5:peers6:\xC0\xA8\x01\x01\x1A\xE1e";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.peers, vec!["192.168.1.1:6881".parse().unwrap()]);
    }

    #[test]
    fn parses_dictionary_peers() {
        let body =
            b"d8:intervali900e5:peersld2:ip8:10.0.0.24:porti6881eed2:ip3:bad4:porti1eeee";
        let response = parse_announce_response(body).unwrap();
        // unparseable addresses are skipped, not fatal
        assert_eq!(response.peers, vec!["10.0.0.2:6881".parse().unwrap()]);
    }

    #[test]
    fn parses_peers6() {
        let mut body = b"d8:intervali60e5:peers0:6:peers618:".to_vec();
        let mut entry = [0u8; 18];
        entry[15] = 1;
        entry[16..].copy_from_slice(&6881u16.to_be_bytes());
        body.extend_from_slice(&entry);
        body.push(b'e');
        let response = parse_announce_response(&body).unwrap();
        assert_eq!(response.peers, vec!["[::1]:6881".parse().unwrap()]);
    }

    #[test]
    fn failure_reason_is_a_rejection() {
        let body = b"d14:failure reason12:unregisterede";
        match parse_announce_response(body) {
            Err(TrackerError::Rejected(reason)) => assert_eq!(reason, "unregistered"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn missing_interval_is_invalid() {
        assert!(matches!(
            parse_announce_response(b"d5:peers0:e"),
            Err(TrackerError::InvalidResponse(_))
        ));
    }

    #[test]
    fn optional_counts_are_surfaced() {
        let body = b"d8:completei5e10:incompletei7e8:intervali300e5:peers0:e";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(response.seeders, Some(5));
        assert_eq!(response.leechers, Some(7));
    }
}
