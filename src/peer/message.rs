//! Peer wire messages and framing.
//!
//! After the handshake every message is a 4-byte big-endian length
//! prefix followed by the payload; a zero length is a keep-alive,
//! otherwise the payload starts with a one-byte message id. Ids beyond
//! the base protocol (extension traffic) decode into `Unknown` and are
//! ignored by the session rather than treated as violations.
use super::{PeerError, PeerResult};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. The largest legitimate frames are
/// piece messages (block size + 13) and bitfields of very large
/// torrents; anything beyond this is a corrupt or hostile peer.
pub const MAX_FRAME_BYTES: u32 = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    Port(u16),
    /// An id outside the base protocol; read and discarded.
    Unknown {
        id: u8,
    },
}

impl Message {
    /// Serializes into a length-prefixed frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(17);
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            Message::Have(index) => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(*index);
            }
            Message::Bitfield(bits) => {
                buf.reserve(5 + bits.len());
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(5);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(6);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.reserve(13 + block.len());
                buf.put_u32(9 + block.len() as u32);
                buf.put_u8(7);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(9);
                buf.put_u16(*port);
            }
            Message::Unknown { id } => {
                buf.put_u32(1);
                buf.put_u8(*id);
            }
        }
        buf.freeze()
    }

    /// Parses a non-empty frame payload (the bytes after the length
    /// prefix). Payload lengths inconsistent with the message id are
    /// protocol violations.
    pub fn decode(payload: &[u8]) -> PeerResult<Message> {
        let id = payload[0];
        let body = &payload[1..];
        let message = match id {
            0..=3 => {
                if !body.is_empty() {
                    return Err(violation(id, payload.len()));
                }
                match id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            4 => {
                if body.len() != 4 {
                    return Err(violation(id, payload.len()));
                }
                Message::Have(read_u32(body, 0))
            }
            5 => Message::Bitfield(body.to_vec()),
            6 | 8 => {
                if body.len() != 12 {
                    return Err(violation(id, payload.len()));
                }
                let index = read_u32(body, 0);
                let begin = read_u32(body, 4);
                let length = read_u32(body, 8);
                if id == 6 {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            7 => {
                if body.len() < 8 {
                    return Err(violation(id, payload.len()));
                }
                Message::Piece {
                    index: read_u32(body, 0),
                    begin: read_u32(body, 4),
                    block: body[8..].to_vec(),
                }
            }
            9 => {
                if body.len() != 2 {
                    return Err(violation(id, payload.len()));
                }
                Message::Port(u16::from_be_bytes([body[0], body[1]]))
            }
            id => Message::Unknown { id },
        };
        Ok(message)
    }
}

fn violation(id: u8, len: usize) -> PeerError {
    PeerError::ProtocolViolation(format!("message id {id} with payload length {len}"))
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Reads one framed message, including keep-alives.
pub async fn read_message<R>(reader: &mut R) -> PeerResult<Message>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_u32().await?;
    if length == 0 {
        return Ok(Message::KeepAlive);
    }
    if length > MAX_FRAME_BYTES {
        return Err(PeerError::ProtocolViolation(format!(
            "frame of {length} bytes"
        )));
    }
    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Message::decode(&payload)
}

/// Writes one framed message.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> PeerResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    Ok(())
}
