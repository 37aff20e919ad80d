//! Per-torrent session orchestrator.
//!
//! Owns the torrent's moving parts: the scheduler task, the tracker
//! announce loop, the DHT lookups, the dialer and the optional inbound
//! listener. Components talk over channels; the session only wires them
//! together and exposes status, events and shutdown.
use crate::config::{Config, ConfigError};
use crate::dht::{self, DhtError, DhtHandle};
use crate::peer::{Handshake, PeerSession};
use crate::scheduler::{Progress, Scheduler, SchedulerCommand, SchedulerEvent};
use crate::storage::{Storage, StorageError};
use crate::torrent::{TorrentError, TorrentFile};
use crate::tracker::{self, AnnounceRequest, Event};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Dial timeout for outbound peer connections.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Re-announce fallback when every tracker failed.
const ANNOUNCE_RETRY: Duration = Duration::from_secs(60);

/// Pause between DHT lookups for the same torrent.
const DHT_LOOKUP_INTERVAL: Duration = Duration::from_secs(300);

/// Deadline for the best-effort `stopped` announce at shutdown.
const STOP_ANNOUNCE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Dht(#[from] DhtError),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Structured events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PieceVerified { index: u32 },
    HashMismatch { index: u32 },
    TrackerOk { url: String, peers: usize },
    TrackerFailed { url: String, error: String },
    PeerConnected { addr: SocketAddr },
    Completed,
    Fatal { error: String },
    Stopped,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct Status {
    pub name: String,
    pub info_hash: String,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub peer_count: usize,
    pub piece_fraction: f64,
    pub running: bool,
    pub complete: bool,
}

/// A running download. Dropping the session aborts it; call
/// [`Session::shutdown`] for the cooperative path with the `stopped`
/// announce.
pub struct Session {
    torrent: Arc<TorrentFile>,
    progress: watch::Receiver<Progress>,
    running: watch::Receiver<bool>,
    events: mpsc::Receiver<EngineEvent>,
    shutdown: watch::Sender<bool>,
    control: mpsc::Sender<SchedulerCommand>,
    candidates: mpsc::Sender<Vec<SocketAddr>>,
    announce_done: Option<tokio::task::JoinHandle<()>>,
}

impl Session {
    /// Validates the configuration, creates the storage layout and
    /// spawns the component tasks.
    pub async fn start(torrent: TorrentFile, config: Config) -> EngineResult<Session> {
        config.validate_for(torrent.info.piece_length)?;
        let torrent = Arc::new(torrent);
        tracing::info!(
            name = %torrent.info.name,
            info_hash = %torrent.info_hash,
            size = torrent.total_length(),
            pieces = torrent.piece_count(),
            "session starting"
        );

        let storage = Storage::create(&config.download_dir, &torrent)?;
        let peer_id = tracker::generate_peer_id();

        let (progress_tx, progress) = watch::channel(Progress::default());
        let (scheduler_events_tx, scheduler_events_rx) = mpsc::channel(64);
        let scheduler = Scheduler::new(
            torrent.clone(),
            storage,
            &config,
            progress_tx,
            scheduler_events_tx,
        );

        let (peer_events_tx, peer_events_rx) = mpsc::channel(256);
        let (control, control_rx) = mpsc::channel(16);
        tokio::spawn(scheduler.run(peer_events_rx, control_rx));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (running_tx, running) = watch::channel(true);
        let (events_tx, events) = mpsc::channel(256);
        let (completed_tx, completed_rx) = watch::channel(false);
        let (candidates, candidates_rx) = mpsc::channel(64);

        let dht = if config.enable_dht {
            match dht::spawn(config.dht_port, config.dht_query_timeout).await {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "DHT failed to start, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        // scheduler events fan out to the user stream, the announce
        // loop (completion) and the running flag (fatal errors)
        tokio::spawn(pump_scheduler_events(
            scheduler_events_rx,
            events_tx.clone(),
            completed_tx,
            running_tx,
            shutdown.clone(),
        ));

        tokio::spawn(dialer(
            candidates_rx,
            torrent.clone(),
            peer_id,
            config.max_peers_per_torrent,
            progress.clone(),
            peer_events_tx.clone(),
            events_tx.clone(),
            shutdown_rx.clone(),
        ));

        if config.enable_listener {
            match TcpListener::bind(("0.0.0.0", config.listen_port)).await {
                Ok(listener) => {
                    tokio::spawn(listen_for_peers(
                        listener,
                        torrent.clone(),
                        peer_id,
                        config.max_peers_per_torrent,
                        progress.clone(),
                        peer_events_tx.clone(),
                        events_tx.clone(),
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(port = config.listen_port, error = %e, "inbound listener unavailable");
                }
            }
        }

        let announce_done = tokio::spawn(announce_loop(
            torrent.clone(),
            config.clone(),
            peer_id,
            progress.clone(),
            candidates.clone(),
            events_tx.clone(),
            completed_rx.clone(),
            shutdown_rx.clone(),
        ));

        if let Some(dht) = dht {
            tokio::spawn(dht_loop(
                dht,
                torrent.info_hash,
                config.listen_port,
                candidates.clone(),
                completed_rx,
                shutdown_rx,
            ));
        }

        Ok(Session {
            torrent,
            progress,
            running,
            events,
            shutdown,
            control,
            candidates,
            announce_done: Some(announce_done),
        })
    }

    /// Offers additional peer endpoints, as if a tracker had returned
    /// them.
    pub async fn add_peers(&self, peers: Vec<SocketAddr>) {
        let _ = self.candidates.send(peers).await;
    }

    /// The next structured event, or None after shutdown.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    pub fn status(&self) -> Status {
        let progress = self.progress.borrow().clone();
        let total_pieces = self.torrent.piece_count().max(1);
        Status {
            name: self.torrent.info.name.clone(),
            info_hash: self.torrent.info_hash.to_hex(),
            total_bytes: self.torrent.total_length() as u64,
            downloaded_bytes: progress.downloaded_bytes,
            peer_count: progress.peer_count,
            piece_fraction: progress.verified_pieces as f64 / total_pieces as f64,
            running: *self.running.borrow(),
            complete: progress.complete,
        }
    }

    /// Cooperative shutdown: stops every task, flushes storage via the
    /// scheduler, and sends a bounded best-effort `stopped` announce.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        let _ = self.control.send(SchedulerCommand::Shutdown).await;
        if let Some(done) = self.announce_done.take() {
            if tokio::time::timeout(STOP_ANNOUNCE_DEADLINE, done)
                .await
                .is_err()
            {
                tracing::debug!("stopped announce did not finish in time");
            }
        }
        tracing::info!(info_hash = %self.torrent.info_hash, "session stopped");
    }
}

async fn pump_scheduler_events(
    mut scheduler_events: mpsc::Receiver<SchedulerEvent>,
    events: mpsc::Sender<EngineEvent>,
    completed: watch::Sender<bool>,
    running: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
) {
    while let Some(event) = scheduler_events.recv().await {
        let forwarded = match event {
            SchedulerEvent::PieceVerified { index } => EngineEvent::PieceVerified { index },
            SchedulerEvent::HashMismatch { index } => EngineEvent::HashMismatch { index },
            SchedulerEvent::Completed => {
                let _ = completed.send(true);
                EngineEvent::Completed
            }
            SchedulerEvent::Fatal { error } => {
                tracing::error!(%error, "fatal torrent error");
                let _ = running.send(false);
                let _ = shutdown.send(true);
                EngineEvent::Fatal { error }
            }
        };
        // events are advisory; a slow consumer must not stall the
        // scheduler
        let _ = events.try_send(forwarded);
    }
    let _ = running.send(false);
    let _ = events.try_send(EngineEvent::Stopped);
}

/// Walks the tracker tiers until one answers.
async fn announce_once(
    tiers: &[Vec<String>],
    request: &AnnounceRequest,
    timeout: Duration,
    events: &mpsc::Sender<EngineEvent>,
) -> Option<(String, tracker::AnnounceResponse)> {
    for tier in tiers {
        for url in tier {
            match tracker::announce(url, request, timeout).await {
                Ok(response) => {
                    tracing::debug!(
                        tracker = %url,
                        peers = response.peers.len(),
                        interval = ?response.interval,
                        "announce ok"
                    );
                    let _ = events.try_send(EngineEvent::TrackerOk {
                        url: url.clone(),
                        peers: response.peers.len(),
                    });
                    return Some((url.clone(), response));
                }
                Err(e) => {
                    tracing::debug!(tracker = %url, error = %e, "announce failed");
                    let _ = events.try_send(EngineEvent::TrackerFailed {
                        url: url.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }
    None
}

fn request_for(
    torrent: &TorrentFile,
    peer_id: [u8; 20],
    port: u16,
    progress: &watch::Receiver<Progress>,
    event: Event,
) -> AnnounceRequest {
    let downloaded = progress.borrow().downloaded_bytes;
    let total = torrent.total_length() as u64;
    AnnounceRequest {
        info_hash: torrent.info_hash,
        peer_id,
        port,
        uploaded: 0,
        downloaded,
        left: total.saturating_sub(downloaded),
        event,
    }
}

/// The tracker lifecycle for one torrent: `started`, periodic
/// re-announces at the advertised interval, one `completed`, and a
/// bounded `stopped` on the way out.
#[allow(clippy::too_many_arguments)]
async fn announce_loop(
    torrent: Arc<TorrentFile>,
    config: Config,
    peer_id: [u8; 20],
    progress: watch::Receiver<Progress>,
    candidates: mpsc::Sender<Vec<SocketAddr>>,
    events: mpsc::Sender<EngineEvent>,
    mut completed: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let tiers = torrent.tracker_tiers();
    if tiers.is_empty() {
        tracing::info!("torrent declares no trackers; relying on the DHT");
        return;
    }

    let mut event = Event::Started;
    let mut completed_sent = false;
    let mut last_tracker: Option<String> = None;
    loop {
        let request = request_for(&torrent, peer_id, config.listen_port, &progress, event);
        let outcome =
            announce_once(&tiers, &request, config.announce_timeout, &events).await;
        let interval = match outcome {
            Some((url, response)) => {
                last_tracker = Some(url);
                let mut interval = response.interval;
                if let Some(min_interval) = response.min_interval {
                    interval = interval.max(min_interval);
                }
                if !response.peers.is_empty() {
                    let _ = candidates.send(response.peers).await;
                }
                interval
            }
            None => ANNOUNCE_RETRY,
        };
        event = Event::Periodic;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = completed.changed() => {
                if changed.is_ok() && *completed.borrow() && !completed_sent {
                    completed_sent = true;
                    event = Event::Completed;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // best effort; the session bounds how long it waits for us
    if let Some(url) = last_tracker {
        let request = request_for(&torrent, peer_id, config.listen_port, &progress, Event::Stopped);
        if let Err(e) =
            tracker::announce(&url, &request, STOP_ANNOUNCE_DEADLINE).await
        {
            tracing::debug!(tracker = %url, error = %e, "stopped announce failed");
        }
    }
}

/// Periodic DHT lookups feed the dialer; after completion the torrent
/// is announced to the DHT as well.
async fn dht_loop(
    dht: DhtHandle,
    info_hash: crate::torrent::InfoHash,
    listen_port: u16,
    candidates: mpsc::Sender<Vec<SocketAddr>>,
    mut completed: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut announced = false;
    loop {
        match dht.find_peers(info_hash).await {
            Ok(peers) if !peers.is_empty() => {
                tracing::debug!(count = peers.len(), "DHT lookup produced peers");
                let _ = candidates.send(peers).await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "DHT lookup failed");
            }
        }
        let is_complete = *completed.borrow();
        if is_complete && !announced {
            announced = true;
            let _ = dht.announce_peer(info_hash, listen_port).await;
        }

        tokio::select! {
            _ = tokio::time::sleep(DHT_LOOKUP_INTERVAL) => {}
            _ = completed.changed() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    dht.shutdown().await;
}

/// Dials candidate peers, handshakes, and registers the resulting
/// sessions with the scheduler.
#[allow(clippy::too_many_arguments)]
async fn dialer(
    mut candidates: mpsc::Receiver<Vec<SocketAddr>>,
    torrent: Arc<TorrentFile>,
    peer_id: [u8; 20],
    max_peers: usize,
    progress: watch::Receiver<Progress>,
    peer_events: mpsc::Sender<crate::peer::PeerEvent>,
    events: mpsc::Sender<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempted: HashSet<SocketAddr> = HashSet::new();
    loop {
        let batch = tokio::select! {
            batch = candidates.recv() => match batch {
                Some(batch) => batch,
                None => return,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };

        for addr in batch {
            if !attempted.insert(addr) {
                continue;
            }
            if progress.borrow().peer_count >= max_peers {
                tracing::debug!(%addr, "peer cap reached, skipping candidate");
                continue;
            }

            let torrent = torrent.clone();
            let peer_events = peer_events.clone();
            let events = events.clone();
            tokio::spawn(async move {
                match Handshake::connect(addr, torrent.info_hash, peer_id, DIAL_TIMEOUT).await {
                    Ok((stream, theirs)) => {
                        PeerSession::spawn(stream, addr, theirs.peer_id, torrent, peer_events);
                        let _ = events.try_send(EngineEvent::PeerConnected { addr });
                    }
                    Err(e) => {
                        tracing::debug!(peer = %addr, error = %e, "dial failed");
                    }
                }
            });
        }
    }
}

/// Accepts inbound peers: the handshake runs in reverse (read theirs
/// first) and the session then joins the table like any dialed peer.
#[allow(clippy::too_many_arguments)]
async fn listen_for_peers(
    listener: TcpListener,
    torrent: Arc<TorrentFile>,
    peer_id: [u8; 20],
    max_peers: usize,
    progress: watch::Receiver<Progress>,
    peer_events: mpsc::Sender<crate::peer::PeerEvent>,
    events: mpsc::Sender<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (mut stream, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::debug!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };

        if progress.borrow().peer_count >= max_peers {
            tracing::debug!(%addr, "peer cap reached, refusing inbound peer");
            continue;
        }

        let torrent = torrent.clone();
        let peer_events = peer_events.clone();
        let events = events.clone();
        tokio::spawn(async move {
            match Handshake::accept(&mut stream, torrent.info_hash, peer_id, DIAL_TIMEOUT).await {
                Ok(theirs) => {
                    PeerSession::spawn(stream, addr, theirs.peer_id, torrent, peer_events);
                    let _ = events.try_send(EngineEvent::PeerConnected { addr });
                }
                Err(e) => {
                    tracing::debug!(peer = %addr, error = %e, "inbound handshake failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::message::{read_message, write_message};
    use crate::peer::Message;
    use sha1::{Digest, Sha1};
    use tokio::io::AsyncWriteExt;

    /// piece_length 4, content "abcdef": two pieces.
    fn abcdef_torrent() -> TorrentFile {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&Sha1::digest(b"abcd"));
        pieces.extend_from_slice(&Sha1::digest(b"ef"));
        let mut data = Vec::new();
        data.extend_from_slice(
            b"d8:announce22:http://127.0.0.1:1/ann4:infod6:lengthi6e4:name3:out12:piece lengthi4e6:pieces40:",
        );
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        TorrentFile::from_bytes(&data).unwrap()
    }

    /// A minimal seeder: accepts one connection, handshakes, offers
    /// everything, serves blocks of "abcdef".
    async fn fake_seeder(info_hash: crate::torrent::InfoHash) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            Handshake::accept(&mut stream, info_hash, [7u8; 20], Duration::from_secs(5))
                .await
                .unwrap();
            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, &Message::Bitfield(vec![0xC0]))
                .await
                .unwrap();
            write_message(&mut writer, &Message::Unchoke).await.unwrap();

            let content = b"abcdef";
            loop {
                match read_message(&mut reader).await {
                    Ok(Message::Request {
                        index,
                        begin,
                        length,
                    }) => {
                        let start = index as usize * 4 + begin as usize;
                        let block = content[start..start + length as usize].to_vec();
                        write_message(
                            &mut writer,
                            &Message::Piece {
                                index,
                                begin,
                                block,
                            },
                        )
                        .await
                        .unwrap();
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            let _ = writer.shutdown().await;
        });
        addr
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            enable_dht: false,
            enable_listener: false,
            block_size_bytes: 2,
            download_dir: dir.to_path_buf(),
            announce_timeout: Duration::from_millis(200),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn downloads_from_an_injected_peer_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = abcdef_torrent();
        let seeder = fake_seeder(torrent.info_hash).await;

        let mut session = Session::start(torrent, test_config(dir.path()))
            .await
            .unwrap();
        session.add_peers(vec![seeder]).await;

        loop {
            match session.next_event().await.expect("event stream ended early") {
                EngineEvent::Completed => break,
                EngineEvent::Fatal { error } => panic!("fatal: {error}"),
                _ => {}
            }
        }

        let status = session.status();
        assert!(status.complete);
        assert_eq!(status.downloaded_bytes, 6);
        assert_eq!(status.piece_fraction, 1.0);

        session.shutdown().await;
        let content = std::fs::read(dir.path().join("out")).unwrap();
        assert_eq!(content, b"abcdef");
    }

    #[tokio::test]
    async fn rejects_invalid_configuration_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = abcdef_torrent();
        // block size larger than the piece length
        let config = Config {
            block_size_bytes: 16384,
            download_dir: dir.path().to_path_buf(),
            ..test_config(dir.path())
        };
        assert!(matches!(
            Session::start(torrent, config).await,
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn status_reflects_the_torrent_before_any_progress() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::start(abcdef_torrent(), test_config(dir.path()))
            .await
            .unwrap();
        let status = session.status();
        assert_eq!(status.name, "out");
        assert_eq!(status.total_bytes, 6);
        assert_eq!(status.downloaded_bytes, 0);
        assert!(status.running);
        assert!(!status.complete);
        assert_eq!(status.info_hash.len(), 40);
        session.shutdown().await;
    }
}
