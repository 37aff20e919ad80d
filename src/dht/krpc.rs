//! KRPC message codec.
//!
//! KRPC is the bencoded RPC convention of the Mainline DHT: every
//! datagram is a dict with a transaction id `t` and a type tag `y`
//! ("q", "r" or "e"). Messages are modelled as a tagged sum with
//! exhaustive handling; unrecognized query methods decode into a single
//! `Unknown` branch instead of failing the datagram.
use super::{DhtError, DhtResult, NodeId};
use crate::bencode::{self, BencodeValue};
use crate::torrent::InfoHash;
use crate::tracker::{decode_compact_peers, encode_compact_peers};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Error code for "method unknown".
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

/// One entry of a compact node list: 20-byte id, 4-byte IPv4 address,
/// 2-byte big-endian port — 26 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNode {
    pub id: NodeId,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: InfoHash,
        port: u16,
        token: Vec<u8>,
    },
    /// A method this node does not implement; answered with error 204.
    Unknown {
        method: String,
    },
}

/// The `r` dict of a response. Which fields are present depends on the
/// query that was answered; the codec keeps them all optional and the
/// caller interprets them against its in-flight table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    pub id: Option<NodeId>,
    pub token: Option<Vec<u8>>,
    pub nodes: Vec<CompactNode>,
    pub values: Vec<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Query {
        transaction_id: Vec<u8>,
        query: Query,
    },
    Response {
        transaction_id: Vec<u8>,
        response: Response,
    },
    Error {
        transaction_id: Vec<u8>,
        code: i64,
        message: String,
    },
}

impl Message {
    pub fn transaction_id(&self) -> &[u8] {
        match self {
            Message::Query { transaction_id, .. }
            | Message::Response { transaction_id, .. }
            | Message::Error { transaction_id, .. } => transaction_id,
        }
    }

    /// Encodes into a single bencoded datagram.
    pub fn encode(&self) -> DhtResult<Vec<u8>> {
        let mut root = HashMap::new();
        match self {
            Message::Query {
                transaction_id,
                query,
            } => {
                root.insert(b"t".to_vec(), BencodeValue::String(transaction_id.clone()));
                root.insert(b"y".to_vec(), BencodeValue::String(b"q".to_vec()));
                let (method, args) = query_parts(query)?;
                root.insert(b"q".to_vec(), BencodeValue::String(method));
                root.insert(b"a".to_vec(), BencodeValue::Dict(args));
            }
            Message::Response {
                transaction_id,
                response,
            } => {
                root.insert(b"t".to_vec(), BencodeValue::String(transaction_id.clone()));
                root.insert(b"y".to_vec(), BencodeValue::String(b"r".to_vec()));
                root.insert(b"r".to_vec(), BencodeValue::Dict(response_parts(response)));
            }
            Message::Error {
                transaction_id,
                code,
                message,
            } => {
                root.insert(b"t".to_vec(), BencodeValue::String(transaction_id.clone()));
                root.insert(b"y".to_vec(), BencodeValue::String(b"e".to_vec()));
                root.insert(
                    b"e".to_vec(),
                    BencodeValue::List(vec![
                        BencodeValue::Integer(*code),
                        BencodeValue::String(message.clone().into_bytes()),
                    ]),
                );
            }
        }
        Ok(bencode::encode_to_bytes(&BencodeValue::Dict(root))?)
    }

    /// Decodes a datagram. Fails only on structural problems; an
    /// unknown query method is data, not an error.
    pub fn decode(bytes: &[u8]) -> DhtResult<Message> {
        let (value, _) = bencode::decode(bytes)?;
        let dict = match value {
            BencodeValue::Dict(d) => d,
            _ => return Err(DhtError::Malformed("datagram is not a dict".to_string())),
        };

        let transaction_id = required_bytes(&dict, b"t")?;
        let kind = required_bytes(&dict, b"y")?;
        match kind.as_slice() {
            b"q" => {
                let method = required_bytes(&dict, b"q")?;
                let args = match dict.get(&b"a".to_vec()) {
                    Some(BencodeValue::Dict(a)) => a,
                    _ => return Err(DhtError::Malformed("query without args".to_string())),
                };
                Ok(Message::Query {
                    transaction_id,
                    query: parse_query(&method, args)?,
                })
            }
            b"r" => {
                let body = match dict.get(&b"r".to_vec()) {
                    Some(BencodeValue::Dict(r)) => r,
                    _ => return Err(DhtError::Malformed("response without body".to_string())),
                };
                Ok(Message::Response {
                    transaction_id,
                    response: parse_response(body),
                })
            }
            b"e" => {
                let (code, message) = match dict.get(&b"e".to_vec()) {
                    Some(BencodeValue::List(items)) => {
                        let code = items.first().and_then(BencodeValue::as_integer);
                        let message = items
                            .get(1)
                            .and_then(BencodeValue::as_bytes)
                            .map(|b| String::from_utf8_lossy(b).into_owned());
                        match (code, message) {
                            (Some(code), Some(message)) => (code, message),
                            _ => {
                                return Err(DhtError::Malformed(
                                    "error without [code, message]".to_string(),
                                ))
                            }
                        }
                    }
                    _ => return Err(DhtError::Malformed("error without body".to_string())),
                };
                Ok(Message::Error {
                    transaction_id,
                    code,
                    message,
                })
            }
            other => Err(DhtError::Malformed(format!(
                "unknown message type {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

fn query_parts(query: &Query) -> DhtResult<(Vec<u8>, HashMap<Vec<u8>, BencodeValue>)> {
    let mut args = HashMap::new();
    let method: &[u8] = match query {
        Query::Ping { id } => {
            args.insert(b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec()));
            b"ping"
        }
        Query::FindNode { id, target } => {
            args.insert(b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec()));
            args.insert(
                b"target".to_vec(),
                BencodeValue::String(target.as_bytes().to_vec()),
            );
            b"find_node"
        }
        Query::GetPeers { id, info_hash } => {
            args.insert(b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec()));
            args.insert(
                b"info_hash".to_vec(),
                BencodeValue::String(info_hash.as_bytes().to_vec()),
            );
            b"get_peers"
        }
        Query::AnnouncePeer {
            id,
            info_hash,
            port,
            token,
        } => {
            args.insert(b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec()));
            args.insert(
                b"info_hash".to_vec(),
                BencodeValue::String(info_hash.as_bytes().to_vec()),
            );
            args.insert(b"port".to_vec(), BencodeValue::Integer(i64::from(*port)));
            args.insert(b"token".to_vec(), BencodeValue::String(token.clone()));
            b"announce_peer"
        }
        Query::Unknown { method } => {
            return Err(DhtError::Malformed(format!(
                "cannot encode unknown method {method}"
            )))
        }
    };
    Ok((method.to_vec(), args))
}

fn response_parts(response: &Response) -> HashMap<Vec<u8>, BencodeValue> {
    let mut body = HashMap::new();
    if let Some(id) = &response.id {
        body.insert(b"id".to_vec(), BencodeValue::String(id.as_bytes().to_vec()));
    }
    if let Some(token) = &response.token {
        body.insert(b"token".to_vec(), BencodeValue::String(token.clone()));
    }
    if !response.nodes.is_empty() {
        body.insert(
            b"nodes".to_vec(),
            BencodeValue::String(encode_nodes(&response.nodes)),
        );
    }
    if !response.values.is_empty() {
        let values = response
            .values
            .iter()
            .map(|peer| BencodeValue::String(encode_compact_peers(std::slice::from_ref(peer))))
            .collect();
        body.insert(b"values".to_vec(), BencodeValue::List(values));
    }
    body
}

fn parse_query(method: &[u8], args: &HashMap<Vec<u8>, BencodeValue>) -> DhtResult<Query> {
    let id = required_node_id(args, b"id")?;
    match method {
        b"ping" => Ok(Query::Ping { id }),
        b"find_node" => Ok(Query::FindNode {
            id,
            target: required_node_id(args, b"target")?,
        }),
        b"get_peers" => Ok(Query::GetPeers {
            id,
            info_hash: InfoHash::from(*required_node_id(args, b"info_hash")?.as_bytes()),
        }),
        b"announce_peer" => {
            let port = match args.get(&b"port".to_vec()).and_then(BencodeValue::as_integer) {
                Some(port) if (0..=i64::from(u16::MAX)).contains(&port) => port as u16,
                _ => return Err(DhtError::Malformed("announce_peer without port".to_string())),
            };
            let token = args
                .get(&b"token".to_vec())
                .and_then(BencodeValue::as_bytes)
                .ok_or_else(|| DhtError::Malformed("announce_peer without token".to_string()))?
                .to_vec();
            Ok(Query::AnnouncePeer {
                id,
                info_hash: InfoHash::from(*required_node_id(args, b"info_hash")?.as_bytes()),
                port,
                token,
            })
        }
        other => Ok(Query::Unknown {
            method: String::from_utf8_lossy(other).into_owned(),
        }),
    }
}

/// Responses are parsed permissively: a missing or short field becomes
/// an absent field, never a dropped datagram.
fn parse_response(body: &HashMap<Vec<u8>, BencodeValue>) -> Response {
    let id = body
        .get(&b"id".to_vec())
        .and_then(BencodeValue::as_bytes)
        .and_then(NodeId::from_bytes);
    let token = body
        .get(&b"token".to_vec())
        .and_then(BencodeValue::as_bytes)
        .map(<[u8]>::to_vec);
    let nodes = body
        .get(&b"nodes".to_vec())
        .and_then(BencodeValue::as_bytes)
        .map(decode_nodes)
        .unwrap_or_default();
    let values = match body.get(&b"values".to_vec()) {
        Some(BencodeValue::List(items)) => items
            .iter()
            .filter_map(BencodeValue::as_bytes)
            .flat_map(decode_compact_peers)
            .collect(),
        _ => Vec::new(),
    };
    Response {
        id,
        token,
        nodes,
        values,
    }
}

fn required_bytes(dict: &HashMap<Vec<u8>, BencodeValue>, key: &[u8]) -> DhtResult<Vec<u8>> {
    dict.get(key)
        .and_then(BencodeValue::as_bytes)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            DhtError::Malformed(format!("missing key {:?}", String::from_utf8_lossy(key)))
        })
}

fn required_node_id(dict: &HashMap<Vec<u8>, BencodeValue>, key: &[u8]) -> DhtResult<NodeId> {
    dict.get(key)
        .and_then(BencodeValue::as_bytes)
        .and_then(NodeId::from_bytes)
        .ok_or_else(|| {
            DhtError::Malformed(format!(
                "missing 20-byte {:?}",
                String::from_utf8_lossy(key)
            ))
        })
}

/// Parses a compact node list: 26 bytes per node. A trailing partial
/// entry is ignored.
pub fn decode_nodes(bytes: &[u8]) -> Vec<CompactNode> {
    bytes
        .chunks_exact(26)
        .filter_map(|chunk| {
            let id = NodeId::from_bytes(&chunk[..20])?;
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            Some(CompactNode {
                id,
                addr: SocketAddr::new(IpAddr::V4(ip), port),
            })
        })
        .collect()
}

/// Encodes nodes into the 26-byte compact form. Non-IPv4 entries are
/// skipped.
pub fn encode_nodes(nodes: &[CompactNode]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        if let IpAddr::V4(ip) = node.addr.ip() {
            bytes.extend_from_slice(node.id.as_bytes());
            bytes.extend_from_slice(&ip.octets());
            bytes.extend_from_slice(&node.addr.port().to_be_bytes());
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(seed: u8, addr: &str) -> CompactNode {
        CompactNode {
            id: NodeId::from([seed; 20]),
            addr: addr.parse().unwrap(),
        }
    }

    #[test]
    fn compact_nodes_round_trip() {
        let nodes = vec![node(1, "10.0.0.1:6881"), node(2, "192.168.7.9:51413")];
        assert_eq!(decode_nodes(&encode_nodes(&nodes)), nodes);
    }

    #[test]
    fn ping_round_trip() {
        let message = Message::Query {
            transaction_id: b"aa".to_vec(),
            query: Query::Ping {
                id: NodeId::from([7; 20]),
            },
        };
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn ping_wire_format_matches_the_convention() {
        let message = Message::Query {
            transaction_id: b"aa".to_vec(),
            query: Query::Ping {
                id: NodeId::from([b'x'; 20]),
            },
        };
        let encoded = message.encode().unwrap();
        let expected = format!(
            "d1:ad2:id20:{}e1:q4:ping1:t2:aa1:y1:qe",
            "x".repeat(20)
        );
        assert_eq!(encoded, expected.as_bytes());
    }

    #[test]
    fn get_peers_response_with_values_round_trips() {
        let message = Message::Response {
            transaction_id: b"tx".to_vec(),
            response: Response {
                id: Some(NodeId::from([3; 20])),
                token: Some(b"tok".to_vec()),
                nodes: vec![node(9, "10.1.2.3:999")],
                values: vec!["172.16.0.1:6881".parse().unwrap()],
            },
        };
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn announce_peer_round_trips() {
        let message = Message::Query {
            transaction_id: b"q7".to_vec(),
            query: Query::AnnouncePeer {
                id: NodeId::from([1; 20]),
                info_hash: InfoHash::from([2; 20]),
                port: 6881,
                token: b"opaque".to_vec(),
            },
        };
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn unknown_method_decodes_to_the_ignored_branch() {
        let raw = format!("d1:ad2:id20:{}e1:q4:vote1:t2:aa1:y1:qe", "z".repeat(20));
        match Message::decode(raw.as_bytes()).unwrap() {
            Message::Query {
                query: Query::Unknown { method },
                ..
            } => assert_eq!(method, "vote"),
            other => panic!("expected unknown query, got {other:?}"),
        }
    }

    #[test]
    fn krpc_error_decodes() {
        let raw = b"d1:eli201e23:A Generic Error Ocurrede1:t2:aa1:y1:ee";
        match Message::decode(raw).unwrap() {
            Message::Error { code, message, .. } => {
                assert_eq!(code, 201);
                assert_eq!(message, "A Generic Error Ocurred");
            }
            other => panic!("expected error message, got {other:?}"),
        }
    }

    #[test]
    fn structurally_broken_datagrams_are_rejected() {
        assert!(Message::decode(b"i42e").is_err());
        assert!(Message::decode(b"d1:y1:qe").is_err());
        assert!(Message::decode(b"d1:t2:aa1:y1:xe").is_err());
    }
}
