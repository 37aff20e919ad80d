//! Piece scheduler and assembly.
//!
//! The scheduler is the single owner of the per-torrent piece table.
//! Peer sessions deliver their events over a channel; the scheduler
//! decides which blocks to request from whom, assembles and verifies
//! pieces, writes them to storage, and announces progress. Nothing else
//! in the crate mutates piece state.
use crate::config::Config;
use crate::peer::{Bitfield, PeerCommand, PeerEvent, PeerEventKind};
use crate::storage::Storage;
use crate::torrent::TorrentFile;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Repeated hash failures on one piece before the peers that fed it
/// are disconnected.
const MAX_HASH_MISMATCHES: u8 = 3;

/// Per-piece download state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    Requested,
    /// All blocks received, verification pending.
    Complete,
    /// Verified and handed to storage; the buffer is gone.
    Flushed,
}

/// Control-plane input to the scheduler, apart from peer events. Peer
/// registration arrives through the event channel itself (the session's
/// `Connected` event) so it is ordered before the peer's traffic.
#[derive(Debug)]
pub enum SchedulerCommand {
    Shutdown,
}

/// What the scheduler reports upward to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    PieceVerified { index: u32 },
    HashMismatch { index: u32 },
    Completed,
    /// A storage write failed; the torrent cannot continue.
    Fatal { error: String },
}

/// Progress snapshot published through a watch channel.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub verified_pieces: usize,
    pub total_pieces: usize,
    pub downloaded_bytes: u64,
    pub peer_count: usize,
    pub complete: bool,
}

struct Piece {
    size: u32,
    state: PieceState,
    received: HashSet<u32>,
    buffer: Option<Vec<u8>>,
    /// Peers that contributed blocks to the current assembly.
    contributors: HashSet<SocketAddr>,
    mismatches: u8,
}

impl Piece {
    fn block_count(&self, block_size: u32) -> usize {
        (self.size as usize).div_ceil(block_size as usize)
    }
}

/// The scheduler's view of one registered peer.
struct PeerView {
    commands: mpsc::Sender<PeerCommand>,
    bitfield: Option<Bitfield>,
    choked: bool,
    interested: bool,
    inflight: HashSet<(u32, u32, u32)>,
}

pub struct Scheduler {
    torrent: Arc<TorrentFile>,
    storage: Storage,
    block_size: u32,
    pipeline_depth: usize,
    request_timeout: Duration,

    pieces: Vec<Piece>,
    availability: Vec<u32>,
    peers: HashMap<SocketAddr, PeerView>,
    /// Every dispatched block request: (piece, offset) -> who and when.
    inflight: HashMap<(u32, u32), (SocketAddr, Instant)>,

    verified_pieces: usize,
    downloaded_bytes: u64,
    completed_sent: bool,

    progress: watch::Sender<Progress>,
    events: mpsc::Sender<SchedulerEvent>,
}

impl Scheduler {
    pub fn new(
        torrent: Arc<TorrentFile>,
        storage: Storage,
        config: &Config,
        progress: watch::Sender<Progress>,
        events: mpsc::Sender<SchedulerEvent>,
    ) -> Self {
        let pieces = (0..torrent.piece_count())
            .map(|index| Piece {
                size: torrent.piece_size(index) as u32,
                state: PieceState::Missing,
                received: HashSet::new(),
                buffer: None,
                contributors: HashSet::new(),
                mismatches: 0,
            })
            .collect();
        let availability = vec![0; torrent.piece_count()];
        Scheduler {
            torrent,
            storage,
            block_size: config.block_size_bytes,
            pipeline_depth: config.outstanding_requests_per_peer,
            request_timeout: config.piece_request_timeout,
            pieces,
            availability,
            peers: HashMap::new(),
            inflight: HashMap::new(),
            verified_pieces: 0,
            downloaded_bytes: 0,
            completed_sent: false,
            progress,
            events,
        }
    }

    /// Event loop. Exits on shutdown, when every input channel closes,
    /// or on a fatal storage error.
    pub async fn run(
        mut self,
        mut peer_events: mpsc::Receiver<PeerEvent>,
        mut control: mpsc::Receiver<SchedulerCommand>,
    ) {
        self.publish_progress();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let healthy = tokio::select! {
                event = peer_events.recv() => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => break,
                },
                command = control.recv() => match command {
                    Some(SchedulerCommand::Shutdown) | None => break,
                },
                _ = tick.tick() => self.sweep_timeouts().await,
            };
            if !healthy {
                break;
            }
        }
        if let Err(e) = self.storage.sync() {
            tracing::warn!(error = %e, "flushing storage on shutdown failed");
        }
        tracing::debug!("scheduler stopped");
    }

    fn register_peer(&mut self, addr: SocketAddr, commands: mpsc::Sender<PeerCommand>) {
        self.peers.insert(
            addr,
            PeerView {
                commands,
                bitfield: None,
                choked: true,
                interested: false,
                inflight: HashSet::new(),
            },
        );
        self.publish_progress();
    }

    /// Returns false when the torrent hit a fatal error.
    async fn handle_peer_event(&mut self, event: PeerEvent) -> bool {
        let addr = event.peer;
        match event.kind {
            PeerEventKind::Connected { commands } => {
                self.register_peer(addr, commands);
            }
            PeerEventKind::Bitfield(bitfield) => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    for (index, has) in bitfield.iter().enumerate() {
                        if has {
                            self.availability[index] += 1;
                        }
                    }
                    peer.bitfield = Some(bitfield);
                }
                self.update_interest(addr).await;
                self.dispatch(addr).await;
            }
            PeerEventKind::Have(index) => {
                let num_pieces = self.torrent.piece_count();
                if let Some(peer) = self.peers.get_mut(&addr) {
                    let bitfield = peer
                        .bitfield
                        .get_or_insert_with(|| Bitfield::new(num_pieces));
                    if !bitfield.has(index as usize) {
                        bitfield.set(index as usize);
                        self.availability[index as usize] += 1;
                    }
                }
                self.update_interest(addr).await;
                self.dispatch(addr).await;
            }
            PeerEventKind::Choked => {
                // outstanding requests are lost; free the blocks for
                // other peers
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.choked = true;
                    for (index, begin, _) in peer.inflight.drain() {
                        self.inflight.remove(&(index, begin));
                    }
                }
            }
            PeerEventKind::Unchoked => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.choked = false;
                }
                self.dispatch(addr).await;
            }
            PeerEventKind::Block {
                index,
                begin,
                block,
            } => {
                if !self.handle_block(addr, index, begin, &block).await {
                    return false;
                }
                self.dispatch(addr).await;
            }
            PeerEventKind::Disconnected { reason } => {
                tracing::debug!(peer = %addr, %reason, "peer left the table");
                if let Some(peer) = self.peers.remove(&addr) {
                    if let Some(bitfield) = &peer.bitfield {
                        for (index, has) in bitfield.iter().enumerate() {
                            if has {
                                self.availability[index] =
                                    self.availability[index].saturating_sub(1);
                            }
                        }
                    }
                    for (index, begin, _) in peer.inflight {
                        self.inflight.remove(&(index, begin));
                    }
                }
                self.publish_progress();
            }
        }
        true
    }

    /// Files a block into its piece and verifies the piece when it is
    /// the last one missing. Returns false on a fatal storage error.
    async fn handle_block(
        &mut self,
        from: SocketAddr,
        index: u32,
        begin: u32,
        block: &[u8],
    ) -> bool {
        let Some(piece) = self.pieces.get_mut(index as usize) else {
            return true;
        };
        if piece.state == PieceState::Flushed {
            // a late or duplicate block for finished work
            return true;
        }

        if let Some(peer) = self.peers.get_mut(&from) {
            peer.inflight.remove(&(index, begin, block.len() as u32));
        }
        self.inflight.remove(&(index, begin));

        let size = piece.size as usize;
        let buffer = piece.buffer.get_or_insert_with(|| vec![0; size]);
        let end = (begin as usize + block.len()).min(size);
        if (begin as usize) < end {
            buffer[begin as usize..end].copy_from_slice(&block[..end - begin as usize]);
        }
        piece.received.insert(begin);
        piece.contributors.insert(from);

        if piece.received.len() < piece.block_count(self.block_size) {
            return true;
        }
        piece.state = PieceState::Complete;

        // whole piece assembled: verify against the metadata digest
        let digest = Sha1::digest(piece.buffer.as_deref().unwrap_or_default());
        let expected = self.torrent.pieces_hash[index as usize];
        if digest[..] != expected[..] {
            piece.mismatches += 1;
            piece.received.clear();
            piece.buffer = None;
            piece.state = PieceState::Missing;
            let suspects: Vec<SocketAddr> = piece.contributors.drain().collect();
            tracing::warn!(piece = index, mismatches = piece.mismatches, "piece failed verification");
            let over_limit = piece.mismatches >= MAX_HASH_MISMATCHES;
            let _ = self
                .events
                .send(SchedulerEvent::HashMismatch { index })
                .await;
            if over_limit {
                for suspect in suspects {
                    if let Some(peer) = self.peers.get(&suspect) {
                        let _ = peer.commands.send(PeerCommand::Close).await;
                    }
                }
            }
            return true;
        }

        let buffer = piece.buffer.take().unwrap_or_default();
        piece.state = PieceState::Flushed;
        piece.contributors.clear();
        piece.received.clear();
        let offset = u64::from(index) * self.torrent.info.piece_length as u64;
        if let Err(e) = self.storage.write_piece(offset, &buffer) {
            tracing::error!(piece = index, error = %e, "storage write failed");
            let _ = self
                .events
                .send(SchedulerEvent::Fatal {
                    error: e.to_string(),
                })
                .await;
            return false;
        }

        self.verified_pieces += 1;
        self.downloaded_bytes += buffer.len() as u64;
        tracing::debug!(piece = index, verified = self.verified_pieces, "piece verified");
        let _ = self
            .events
            .send(SchedulerEvent::PieceVerified { index })
            .await;

        // the new piece changes what we can offer and what we need
        self.broadcast_have(index).await;
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.update_interest(addr).await;
        }

        if self.verified_pieces == self.pieces.len() && !self.completed_sent {
            self.completed_sent = true;
            tracing::info!("download complete");
            let _ = self.events.send(SchedulerEvent::Completed).await;
        }
        self.publish_progress();
        true
    }

    /// Keeps the peer's pipeline full while it has blocks we need.
    async fn dispatch(&mut self, addr: SocketAddr) {
        loop {
            let Some(peer) = self.peers.get(&addr) else {
                return;
            };
            if peer.choked || peer.inflight.len() >= self.pipeline_depth {
                return;
            }
            let Some(bitfield) = peer.bitfield.clone() else {
                return;
            };
            let Some((index, begin, length)) = self.pick_block(&bitfield) else {
                return;
            };

            let piece = &mut self.pieces[index as usize];
            if piece.state == PieceState::Missing {
                piece.state = PieceState::Requested;
            }
            self.inflight
                .insert((index, begin), (addr, Instant::now()));
            let Some(peer) = self.peers.get_mut(&addr) else {
                return;
            };
            peer.inflight.insert((index, begin, length));
            if peer
                .commands
                .send(PeerCommand::Request {
                    index,
                    begin,
                    length,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }

    /// Chooses the next block to ask this peer for: in-flight pieces
    /// first so they finish sooner, then rarer pieces, then lowest
    /// index.
    fn pick_block(&self, bitfield: &Bitfield) -> Option<(u32, u32, u32)> {
        let mut candidates: Vec<usize> = (0..self.pieces.len())
            .filter(|&index| {
                matches!(
                    self.pieces[index].state,
                    PieceState::Missing | PieceState::Requested
                ) && bitfield.has(index)
            })
            .collect();
        candidates.sort_by_key(|&index| {
            (
                self.pieces[index].state != PieceState::Requested,
                self.availability[index],
                index,
            )
        });

        for index in candidates {
            let piece = &self.pieces[index];
            let mut begin = 0u32;
            while begin < piece.size {
                let taken = piece.received.contains(&begin)
                    || self.inflight.contains_key(&(index as u32, begin));
                if !taken {
                    let length = self.block_size.min(piece.size - begin);
                    return Some((index as u32, begin, length));
                }
                begin += self.block_size;
            }
        }
        None
    }

    async fn update_interest(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let interesting = peer.bitfield.as_ref().is_some_and(|bitfield| {
            (0..self.pieces.len())
                .any(|index| self.pieces[index].state != PieceState::Flushed && bitfield.has(index))
        });
        if peer.interested != interesting {
            let _ = peer.commands.send(PeerCommand::Interested(interesting)).await;
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.interested = interesting;
            }
        }
    }

    async fn broadcast_have(&self, index: u32) {
        for peer in self.peers.values() {
            let _ = peer.commands.send(PeerCommand::Have(index)).await;
        }
    }

    /// Drops requests that have been in flight longer than the request
    /// timeout so other peers can pick the blocks up. The stale peer
    /// gets a cancel for the block it sat on. Returns true; the
    /// signature matches the other select arms.
    async fn sweep_timeouts(&mut self) -> bool {
        let now = Instant::now();
        let expired: Vec<((u32, u32), SocketAddr)> = self
            .inflight
            .iter()
            .filter(|(_, (_, since))| now.duration_since(*since) > self.request_timeout)
            .map(|(key, (addr, _))| (*key, *addr))
            .collect();

        let mut cancels = Vec::new();
        for ((index, begin), addr) in expired {
            self.inflight.remove(&(index, begin));
            if let Some(peer) = self.peers.get_mut(&addr) {
                let entry = peer
                    .inflight
                    .iter()
                    .find(|(i, b, _)| *i == index && *b == begin)
                    .copied();
                if let Some(entry) = entry {
                    peer.inflight.remove(&entry);
                    cancels.push((addr, entry));
                }
            }
            tracing::debug!(piece = index, offset = begin, peer = %addr, "block request timed out");
        }

        let reissue = !cancels.is_empty();
        for (addr, (index, begin, length)) in cancels {
            if let Some(peer) = self.peers.get(&addr) {
                let _ = peer
                    .commands
                    .send(PeerCommand::Cancel {
                        index,
                        begin,
                        length,
                    })
                    .await;
            }
        }
        if reissue {
            let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
            for addr in addrs {
                self.dispatch(addr).await;
            }
        }
        true
    }

    fn publish_progress(&self) {
        let _ = self.progress.send(Progress {
            verified_pieces: self.verified_pieces,
            total_pieces: self.pieces.len(),
            downloaded_bytes: self.downloaded_bytes,
            peer_count: self.peers.len(),
            complete: self.verified_pieces == self.pieces.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    /// piece_length 4, content "abcdef": two pieces, 4 and 2 bytes.
    fn abcdef_torrent() -> Arc<TorrentFile> {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&Sha1::digest(b"abcd"));
        pieces.extend_from_slice(&Sha1::digest(b"ef"));
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce4:http4:infod6:lengthi6e4:name3:out12:piece lengthi4e6:pieces40:");
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        Arc::new(TorrentFile::from_bytes(&data).unwrap())
    }

    struct Fixture {
        peer_events: mpsc::Sender<PeerEvent>,
        control: mpsc::Sender<SchedulerCommand>,
        events: mpsc::Receiver<SchedulerEvent>,
        progress: watch::Receiver<Progress>,
        addr: SocketAddr,
        peer_commands: mpsc::Receiver<PeerCommand>,
    }

    async fn start(dir: &Path, torrent: Arc<TorrentFile>, config: Config) -> Fixture {
        let storage = Storage::create(dir, &torrent).unwrap();
        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        let (events_tx, events_rx) = mpsc::channel(64);
        let scheduler = Scheduler::new(torrent, storage, &config, progress_tx, events_tx);

        let (peer_events_tx, peer_events_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(8);
        tokio::spawn(scheduler.run(peer_events_rx, control_rx));

        let addr: SocketAddr = "127.0.0.1:51413".parse().unwrap();
        let (commands_tx, commands_rx) = mpsc::channel(64);
        peer_events_tx
            .send(PeerEvent {
                peer: addr,
                kind: PeerEventKind::Connected {
                    commands: commands_tx,
                },
            })
            .await
            .unwrap();
        Fixture {
            peer_events: peer_events_tx,
            control: control_tx,
            events: events_rx,
            progress: progress_rx,
            addr,
            peer_commands: commands_rx,
        }
    }

    fn config_with_2_byte_blocks() -> Config {
        Config {
            block_size_bytes: 2,
            ..Config::default()
        }
    }

    async fn event(fixture: &Fixture, kind: PeerEventKind) {
        fixture
            .peer_events
            .send(PeerEvent {
                peer: fixture.addr,
                kind,
            })
            .await
            .unwrap();
    }

    async fn expect_request(fixture: &mut Fixture) -> (u32, u32, u32) {
        loop {
            match fixture.peer_commands.recv().await.unwrap() {
                PeerCommand::Request {
                    index,
                    begin,
                    length,
                } => return (index, begin, length),
                PeerCommand::Interested(_)
                | PeerCommand::Have(_)
                | PeerCommand::Cancel { .. } => continue,
                other => panic!("unexpected command {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn assembles_verifies_and_writes_out_of_order_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = start(dir.path(), abcdef_torrent(), config_with_2_byte_blocks()).await;

        event(&fixture, PeerEventKind::Bitfield(Bitfield::from_bytes(&[0xC0], 2).unwrap())).await;
        event(&fixture, PeerEventKind::Unchoked).await;

        // the pipeline asks for three blocks: (0,0,2) (0,2,2) (1,0,2)
        let mut asked = HashSet::new();
        for _ in 0..3 {
            asked.insert(expect_request(&mut fixture).await);
        }
        assert_eq!(
            asked,
            HashSet::from([(0, 0, 2), (0, 2, 2), (1, 0, 2)])
        );

        // blocks arrive in scrambled order, with one duplicate
        for (index, begin, block) in [
            (1u32, 0u32, b"ef".to_vec()),
            (0, 2, b"cd".to_vec()),
            (0, 2, b"cd".to_vec()),
            (0, 0, b"ab".to_vec()),
        ] {
            event(
                &fixture,
                PeerEventKind::Block {
                    index,
                    begin,
                    block,
                },
            )
            .await;
        }

        let mut verified = HashSet::new();
        loop {
            match fixture.events.recv().await.unwrap() {
                SchedulerEvent::PieceVerified { index } => {
                    verified.insert(index);
                }
                SchedulerEvent::Completed => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(verified, HashSet::from([0, 1]));

        fixture.control.send(SchedulerCommand::Shutdown).await.unwrap();
        // storage flushes on shutdown
        tokio::time::sleep(Duration::from_millis(50)).await;
        let content = std::fs::read(dir.path().join("out")).unwrap();
        assert_eq!(content, b"abcdef");

        let progress = fixture.progress.borrow().clone();
        assert!(progress.complete);
        assert_eq!(progress.downloaded_bytes, 6);
    }

    #[tokio::test]
    async fn hash_mismatch_resets_the_piece_and_rerequests() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = start(dir.path(), abcdef_torrent(), config_with_2_byte_blocks()).await;

        // the peer only has piece 1
        event(&fixture, PeerEventKind::Bitfield(Bitfield::from_bytes(&[0x40], 2).unwrap())).await;
        event(&fixture, PeerEventKind::Unchoked).await;
        assert_eq!(expect_request(&mut fixture).await, (1, 0, 2));

        event(
            &fixture,
            PeerEventKind::Block {
                index: 1,
                begin: 0,
                block: b"XX".to_vec(),
            },
        )
        .await;
        assert_eq!(
            fixture.events.recv().await.unwrap(),
            SchedulerEvent::HashMismatch { index: 1 }
        );
        // the piece went back to missing and is re-requested
        assert_eq!(expect_request(&mut fixture).await, (1, 0, 2));
    }

    #[tokio::test]
    async fn repeated_mismatches_close_the_contributing_peer() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = start(dir.path(), abcdef_torrent(), config_with_2_byte_blocks()).await;

        event(&fixture, PeerEventKind::Bitfield(Bitfield::from_bytes(&[0x40], 2).unwrap())).await;
        event(&fixture, PeerEventKind::Unchoked).await;

        for round in 0..3 {
            assert_eq!(expect_request(&mut fixture).await, (1, 0, 2));
            event(
                &fixture,
                PeerEventKind::Block {
                    index: 1,
                    begin: 0,
                    block: b"XX".to_vec(),
                },
            )
            .await;
            assert_eq!(
                fixture.events.recv().await.unwrap(),
                SchedulerEvent::HashMismatch { index: 1 }
            );
            let _ = round;
        }

        // after the third strike the scheduler tells the peer to close
        loop {
            match fixture.peer_commands.recv().await.unwrap() {
                PeerCommand::Close => break,
                PeerCommand::Request { .. }
                | PeerCommand::Interested(_)
                | PeerCommand::Have(_) => continue,
                other => panic!("unexpected command {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_requests_are_reissued() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            block_size_bytes: 2,
            piece_request_timeout: Duration::from_secs(30),
            ..Config::default()
        };
        let mut fixture = start(dir.path(), abcdef_torrent(), config).await;

        event(&fixture, PeerEventKind::Bitfield(Bitfield::from_bytes(&[0x40], 2).unwrap())).await;
        event(&fixture, PeerEventKind::Unchoked).await;
        assert_eq!(expect_request(&mut fixture).await, (1, 0, 2));

        // no reply; the sweep frees the block and asks again
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(expect_request(&mut fixture).await, (1, 0, 2));
    }

    #[tokio::test]
    async fn choke_frees_inflight_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = start(dir.path(), abcdef_torrent(), config_with_2_byte_blocks()).await;

        event(&fixture, PeerEventKind::Bitfield(Bitfield::from_bytes(&[0x40], 2).unwrap())).await;
        event(&fixture, PeerEventKind::Unchoked).await;
        assert_eq!(expect_request(&mut fixture).await, (1, 0, 2));

        event(&fixture, PeerEventKind::Choked).await;
        event(&fixture, PeerEventKind::Unchoked).await;
        // the same block is requested again after the re-unchoke
        assert_eq!(expect_request(&mut fixture).await, (1, 0, 2));
    }
}
