//! Per-peer session task.
//!
//! Each connected peer gets one task owning the socket. Inbound
//! messages update the session's four-flag state and are forwarded to
//! the scheduler as [`PeerEvent`]s over a channel; the scheduler steers
//! the session with [`PeerCommand`]s. The session never touches piece
//! state itself.
use super::message::{self, Message};
use super::{Bitfield, PeerError, PeerResult};
use crate::torrent::TorrentFile;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Send a keep-alive after this much send-side silence.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// Disconnect a peer that has been completely silent for this long.
const IDLE_LIMIT: Duration = Duration::from_secs(150);

/// Instructions from the scheduler to one peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// Declare or retract interest.
    Interested(bool),
    /// Ask for a block. Ignored while the peer is choking us.
    Request { index: u32, begin: u32, length: u32 },
    /// Retract an earlier request.
    Cancel { index: u32, begin: u32, length: u32 },
    /// Tell the peer we acquired a piece.
    Have(u32),
    /// Close the session.
    Close,
}

/// What happened on one peer session, as seen by the scheduler.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer: SocketAddr,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// First event of every session. Carries the command channel so
    /// the scheduler learns about the peer strictly before any of its
    /// traffic.
    Connected {
        commands: mpsc::Sender<PeerCommand>,
    },
    Bitfield(Bitfield),
    Have(u32),
    Choked,
    Unchoked,
    Block {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Disconnected {
        reason: String,
    },
}

/// Mutable state of one live peer connection.
pub struct PeerSession {
    addr: SocketAddr,
    remote_peer_id: [u8; 20],
    torrent: Arc<TorrentFile>,
    events: mpsc::Sender<PeerEvent>,

    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    bitfield: Option<Bitfield>,
    outstanding: HashSet<(u32, u32, u32)>,
    saw_have_or_piece: bool,
    last_activity: Instant,
    last_send: Instant,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("addr", &self.addr)
            .field("peer_id", &hex::encode(self.remote_peer_id))
            .field("am_choking", &self.am_choking)
            .field("am_interested", &self.am_interested)
            .field("peer_choking", &self.peer_choking)
            .field("peer_interested", &self.peer_interested)
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

impl PeerSession {
    /// Spawns the session task over an already-handshaken stream and
    /// returns the command channel for steering it.
    pub fn spawn<S>(
        stream: S,
        addr: SocketAddr,
        remote_peer_id: [u8; 20],
        torrent: Arc<TorrentFile>,
        events: mpsc::Sender<PeerEvent>,
    ) -> mpsc::Sender<PeerCommand>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let scheduler_commands = commands_tx.clone();
        let session = PeerSession {
            addr,
            remote_peer_id,
            torrent,
            events,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: None,
            outstanding: HashSet::new(),
            saw_have_or_piece: false,
            last_activity: Instant::now(),
            last_send: Instant::now(),
        };
        tokio::spawn(session.run(stream, commands_rx, scheduler_commands));
        commands_tx
    }

    async fn run<S>(
        mut self,
        stream: S,
        mut commands: mpsc::Receiver<PeerCommand>,
        scheduler_commands: mpsc::Sender<PeerCommand>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        tracing::debug!(peer = %self.addr, peer_id = %hex::encode(self.remote_peer_id), "peer session started");
        self.emit(PeerEventKind::Connected {
            commands: scheduler_commands,
        })
        .await;

        let mut timers = tokio::time::interval(Duration::from_secs(10));
        let reason = loop {
            tokio::select! {
                received = message::read_message(&mut reader) => {
                    let message = match received {
                        Ok(message) => message,
                        Err(e) => break e.to_string(),
                    };
                    self.last_activity = Instant::now();
                    match self.handle_message(message).await {
                        Ok(true) => {}
                        Ok(false) => break "session closed".to_string(),
                        Err(e) => break e.to_string(),
                    }
                }
                command = commands.recv() => {
                    match command {
                        None | Some(PeerCommand::Close) => break "session closed".to_string(),
                        Some(command) => {
                            if let Err(e) = self.handle_command(command, &mut writer).await {
                                break e.to_string();
                            }
                        }
                    }
                }
                _ = timers.tick() => {
                    let now = Instant::now();
                    if now.duration_since(self.last_activity) > IDLE_LIMIT {
                        break "peer idle".to_string();
                    }
                    if now.duration_since(self.last_send) > KEEPALIVE_INTERVAL {
                        if let Err(e) = self.send(&mut writer, &Message::KeepAlive).await {
                            break e.to_string();
                        }
                    }
                }
            }
        };

        tracing::debug!(peer = %self.addr, %reason, "peer session ended");
        let _ = self
            .events
            .send(PeerEvent {
                peer: self.addr,
                kind: PeerEventKind::Disconnected { reason },
            })
            .await;
    }

    /// Applies one inbound message. Returns Ok(false) to close the
    /// session without treating it as an error.
    async fn handle_message(&mut self, message: Message) -> PeerResult<bool> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                // in-flight requests are lost; the scheduler reissues
                self.outstanding.clear();
                self.emit(PeerEventKind::Choked).await;
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.emit(PeerEventKind::Unchoked).await;
            }
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have(index) => {
                if index as usize >= self.torrent.piece_count() {
                    return Err(PeerError::ProtocolViolation(format!(
                        "have for piece {index} of {}",
                        self.torrent.piece_count()
                    )));
                }
                self.saw_have_or_piece = true;
                let bitfield = self
                    .bitfield
                    .get_or_insert_with(|| Bitfield::new(self.torrent.piece_count()));
                bitfield.set(index as usize);
                self.emit(PeerEventKind::Have(index)).await;
            }
            Message::Bitfield(bytes) => {
                if self.saw_have_or_piece || self.bitfield.is_some() {
                    return Err(PeerError::ProtocolViolation(
                        "bitfield after inventory messages".to_string(),
                    ));
                }
                let bitfield = Bitfield::from_bytes(&bytes, self.torrent.piece_count())?;
                self.bitfield = Some(bitfield.clone());
                self.emit(PeerEventKind::Bitfield(bitfield)).await;
            }
            Message::Request { index, begin, length } => {
                // seeding is out of scope; accepting and dropping the
                // request keeps the connection healthy
                tracing::trace!(peer = %self.addr, index, begin, length, "dropping peer request");
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                self.validate_block(index, begin, block.len())?;
                self.saw_have_or_piece = true;
                self.outstanding
                    .remove(&(index, begin, block.len() as u32));
                self.emit(PeerEventKind::Block {
                    index,
                    begin,
                    block,
                })
                .await;
            }
            Message::Cancel { .. } => {}
            Message::Port(port) => {
                tracing::trace!(peer = %self.addr, port, "peer advertised DHT port");
            }
            Message::Unknown { id } => {
                tracing::trace!(peer = %self.addr, id, "ignoring unknown message id");
            }
        }
        Ok(true)
    }

    async fn handle_command<W>(&mut self, command: PeerCommand, writer: &mut W) -> PeerResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        match command {
            PeerCommand::Interested(interested) => {
                if self.am_interested != interested {
                    self.am_interested = interested;
                    let message = if interested {
                        Message::Interested
                    } else {
                        Message::NotInterested
                    };
                    self.send(writer, &message).await?;
                }
            }
            PeerCommand::Request {
                index,
                begin,
                length,
            } => {
                if self.peer_choking {
                    tracing::trace!(peer = %self.addr, index, begin, "not requesting while choked");
                    return Ok(());
                }
                self.outstanding.insert((index, begin, length));
                self.send(
                    writer,
                    &Message::Request {
                        index,
                        begin,
                        length,
                    },
                )
                .await?;
            }
            PeerCommand::Cancel {
                index,
                begin,
                length,
            } => {
                if self.outstanding.remove(&(index, begin, length)) {
                    self.send(
                        writer,
                        &Message::Cancel {
                            index,
                            begin,
                            length,
                        },
                    )
                    .await?;
                }
            }
            PeerCommand::Have(index) => {
                self.send(writer, &Message::Have(index)).await?;
            }
            PeerCommand::Close => unreachable!("handled in the event loop"),
        }
        Ok(())
    }

    fn validate_block(&self, index: u32, begin: u32, len: usize) -> PeerResult<()> {
        if index as usize >= self.torrent.piece_count() {
            return Err(PeerError::ProtocolViolation(format!(
                "piece message for piece {index} of {}",
                self.torrent.piece_count()
            )));
        }
        let piece_size = self.torrent.piece_size(index as usize);
        if i64::from(begin) + len as i64 > piece_size {
            return Err(PeerError::ProtocolViolation(format!(
                "block {begin}+{len} beyond piece size {piece_size}"
            )));
        }
        Ok(())
    }

    async fn send<W>(&mut self, writer: &mut W, message: &Message) -> PeerResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        message::write_message(writer, message).await?;
        self.last_send = Instant::now();
        Ok(())
    }

    async fn emit(&self, kind: PeerEventKind) {
        let _ = self
            .events
            .send(PeerEvent {
                peer: self.addr,
                kind,
            })
            .await;
    }
}
