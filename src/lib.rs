//! Library root for rs-torrent-engine.
//!
//! A BitTorrent download engine: bencode codec, torrent metadata,
//! HTTP/UDP tracker clients, a Mainline DHT node, the peer wire
//! protocol, and the piece scheduler that assembles, verifies and
//! stores the content. The [`session::Session`] type ties the pieces
//! together for one torrent.
pub mod bencode;
pub mod config;
pub mod dht;
pub mod peer;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use config::Config;
pub use session::{EngineError, EngineEvent, Session, Status};
pub use torrent::{InfoHash, TorrentFile};
