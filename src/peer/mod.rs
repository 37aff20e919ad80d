//! Peer wire protocol engine.
//!
//! One long-lived TCP session per peer: the 68-byte handshake, the
//! length-prefixed message framing, and the per-peer session task that
//! keeps the four choke/interest flags and relays events to the piece
//! scheduler.
use thiserror::Error;

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod session;

pub use bitfield::Bitfield;
pub use handshake::Handshake;
pub use message::Message;
pub use session::{PeerCommand, PeerEvent, PeerEventKind, PeerSession};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: invalid protocol identifier")]
    HandshakeInvalidProtocol,

    #[error("Handshake failed: info hash mismatch")]
    HandshakeInfoHashMismatch,

    #[error("Peer timed out")]
    Timeout,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
