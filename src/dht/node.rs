//! The DHT task: one UDP socket, one routing table, one owner.
//!
//! All DHT state is owned by a single tokio task; the rest of the crate
//! talks to it through a [`DhtHandle`]. Iterative lookups are modelled
//! as a pure [`LookupState`] the task drives from its event loop, so
//! the convergence rules are testable without sockets.
use super::krpc::{CompactNode, Message, Query, Response, ERROR_METHOD_UNKNOWN};
use super::routing::{Insert, RoutingTable, BUCKET_SIZE};
use super::{DhtError, DhtResult, Distance, NodeId, BOOTSTRAP_NODES};
use crate::torrent::InfoHash;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Lookup parallelism per round.
const ALPHA: usize = 3;

/// Upper bound on lookup rounds; convergence usually ends a lookup
/// sooner.
const MAX_ROUNDS: usize = 5;

/// Wall-clock bound on a whole iterative lookup.
const LOOKUP_DEADLINE: Duration = Duration::from_secs(60);

/// Handle to the running DHT task.
#[derive(Clone)]
pub struct DhtHandle {
    commands: mpsc::Sender<Command>,
    local_addr: SocketAddr,
}

enum Command {
    FindPeers {
        info_hash: InfoHash,
        reply: oneshot::Sender<Vec<SocketAddr>>,
    },
    AnnouncePeer {
        info_hash: InfoHash,
        port: u16,
    },
    /// A resolved bootstrap endpoint, delivered by the resolver task.
    Bootstrap(SocketAddr),
    Shutdown,
}

impl DhtHandle {
    /// Runs an iterative `get_peers` lookup and returns the peers it
    /// accumulated. An unreachable or empty DHT yields an empty list,
    /// not an error.
    pub async fn find_peers(&self, info_hash: InfoHash) -> DhtResult<Vec<SocketAddr>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::FindPeers { info_hash, reply })
            .await
            .map_err(|_| DhtError::TaskStopped)?;
        rx.await.map_err(|_| DhtError::TaskStopped)
    }

    /// Announces our listen port to the nodes closest to `info_hash`.
    /// Runs a lookup to collect fresh tokens first.
    pub async fn announce_peer(&self, info_hash: InfoHash, port: u16) -> DhtResult<()> {
        self.commands
            .send(Command::AnnouncePeer { info_hash, port })
            .await
            .map_err(|_| DhtError::TaskStopped)
    }

    /// Asks the task to stop. Pending lookups resolve with what they
    /// have.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Binds the DHT socket and spawns the task.
pub async fn spawn(port: u16, query_timeout: Duration) -> DhtResult<DhtHandle> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    let local_addr = socket.local_addr()?;
    let own_id = NodeId::random();
    tracing::info!(%local_addr, node_id = %hex::encode(own_id.as_bytes()), "DHT node starting");

    let (commands, rx) = mpsc::channel(64);
    let task = DhtTask {
        socket,
        routing: RoutingTable::new(own_id),
        query_timeout,
        pending: HashMap::new(),
        lookups: HashMap::new(),
        replacements: HashMap::new(),
        next_transaction: rand::random(),
        next_lookup: 0,
    };
    tokio::spawn(task.run(rx));

    // resolve the bootstrap hosts off the event loop; slow DNS must not
    // delay inbound traffic
    let bootstrap_commands = commands.clone();
    tokio::spawn(async move {
        for host in BOOTSTRAP_NODES {
            match tokio::net::lookup_host(host).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.find(SocketAddr::is_ipv4) {
                        if bootstrap_commands
                            .send(Command::Bootstrap(addr))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(e) => tracing::debug!(host, error = %e, "bootstrap host did not resolve"),
            }
        }
    });

    Ok(DhtHandle {
        commands,
        local_addr,
    })
}

/// Why a query was sent; drives what happens to its response.
enum Purpose {
    Bootstrap,
    LookupGetPeers { lookup: u64 },
    MaintenancePing { target: NodeId },
    Announce,
}

struct PendingQuery {
    node_id: Option<NodeId>,
    addr: SocketAddr,
    deadline: Instant,
    purpose: Purpose,
}

struct Lookup {
    state: LookupState,
    reply: Option<oneshot::Sender<Vec<SocketAddr>>>,
    announce_port: Option<u16>,
    info_hash: InfoHash,
    pending: usize,
    deadline: Instant,
}

struct DhtTask {
    socket: UdpSocket,
    routing: RoutingTable,
    query_timeout: Duration,
    /// Outstanding queries keyed by transaction id.
    pending: HashMap<Vec<u8>, PendingQuery>,
    lookups: HashMap<u64, Lookup>,
    /// Full-bucket candidates waiting for the incumbent to fail its
    /// pings: incumbent id -> candidate.
    replacements: HashMap<NodeId, (NodeId, SocketAddr)>,
    next_transaction: u16,
    next_lookup: u64,
}

enum Step {
    Datagram(Vec<u8>, SocketAddr),
    Command(Option<Command>),
    Tick,
}

impl DhtTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut sweep = tokio::time::interval(Duration::from_millis(500));
        let mut buf = [0u8; 2048];
        loop {
            let step = tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => Step::Datagram(buf[..len].to_vec(), from),
                    Err(e) => {
                        tracing::debug!(error = %e, "DHT socket receive error");
                        continue;
                    }
                },
                command = commands.recv() => Step::Command(command),
                _ = sweep.tick() => Step::Tick,
            };
            match step {
                Step::Datagram(datagram, from) => self.handle_datagram(&datagram, from).await,
                Step::Command(None) | Step::Command(Some(Command::Shutdown)) => break,
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Tick => self.sweep().await,
            }
        }
        tracing::debug!("DHT task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::FindPeers { info_hash, reply } => {
                self.start_lookup(info_hash, Some(reply), None).await;
            }
            Command::AnnouncePeer { info_hash, port } => {
                self.start_lookup(info_hash, None, Some(port)).await;
            }
            Command::Bootstrap(addr) => {
                // ask the entry point for nodes near our own id
                let own_id = self.routing.own_id();
                self.send_query(
                    Query::FindNode {
                        id: own_id,
                        target: own_id,
                    },
                    None,
                    addr,
                    Purpose::Bootstrap,
                )
                .await;
            }
            Command::Shutdown => unreachable!("handled in the event loop"),
        }
    }

    async fn start_lookup(
        &mut self,
        info_hash: InfoHash,
        reply: Option<oneshot::Sender<Vec<SocketAddr>>>,
        announce_port: Option<u16>,
    ) {
        let target = NodeId::from(info_hash);
        let seeds = self.routing.closest(&target, BUCKET_SIZE);
        if seeds.is_empty() {
            tracing::warn!(%info_hash, "lookup started with an empty routing table");
            if let Some(reply) = reply {
                let _ = reply.send(Vec::new());
            }
            return;
        }

        let id = self.next_lookup;
        self.next_lookup += 1;
        self.lookups.insert(
            id,
            Lookup {
                state: LookupState::new(target, seeds),
                reply,
                announce_port,
                info_hash,
                pending: 0,
                deadline: Instant::now() + LOOKUP_DEADLINE,
            },
        );
        self.advance_lookup(id).await;
    }

    /// Sends the next batch of `get_peers` queries, or finishes the
    /// lookup when it has converged, exhausted its rounds, or run out
    /// of time.
    async fn advance_lookup(&mut self, id: u64) {
        let own_id = self.routing.own_id();
        let Some(lookup) = self.lookups.get_mut(&id) else {
            return;
        };
        if lookup.pending > 0 {
            return;
        }

        let batch = if Instant::now() >= lookup.deadline {
            Vec::new()
        } else {
            lookup.state.next_round(ALPHA)
        };
        if batch.is_empty() {
            self.finish_lookup(id).await;
            return;
        }

        let info_hash = lookup.info_hash;
        lookup.pending = batch.len();
        for (node_id, addr) in batch {
            self.send_query(
                Query::GetPeers {
                    id: own_id,
                    info_hash,
                },
                Some(node_id),
                addr,
                Purpose::LookupGetPeers { lookup: id },
            )
            .await;
        }
    }

    async fn finish_lookup(&mut self, id: u64) {
        let Some(lookup) = self.lookups.remove(&id) else {
            return;
        };
        let peers = lookup.state.peers();
        tracing::debug!(
            info_hash = %lookup.info_hash,
            peers = peers.len(),
            rounds = lookup.state.rounds,
            "lookup finished"
        );
        if let Some(reply) = lookup.reply {
            let _ = reply.send(peers);
        }

        if let Some(port) = lookup.announce_port {
            let own_id = self.routing.own_id();
            for (addr, token) in lookup.state.closest_token_holders(BUCKET_SIZE) {
                self.send_query(
                    Query::AnnouncePeer {
                        id: own_id,
                        info_hash: lookup.info_hash,
                        port,
                        token,
                    },
                    None,
                    addr,
                    Purpose::Announce,
                )
                .await;
            }
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(%from, error = %e, "ignoring malformed datagram");
                return;
            }
        };
        match message {
            Message::Query {
                transaction_id,
                query,
            } => self.answer_query(transaction_id, query, from).await,
            Message::Response {
                transaction_id,
                response,
            } => self.accept_response(&transaction_id, response, from).await,
            Message::Error {
                transaction_id,
                code,
                message,
            } => {
                tracing::debug!(%from, code, %message, "KRPC error response");
                if let Some(pending) = self.pending.remove(&transaction_id) {
                    self.note_query_failed(pending).await;
                }
            }
        }
    }

    /// Answers an inbound query. We respond to the three read-only
    /// methods from routing-table state and acknowledge announces
    /// without storing them.
    async fn answer_query(&mut self, transaction_id: Vec<u8>, query: Query, from: SocketAddr) {
        let own_id = self.routing.own_id();
        let reply = match &query {
            Query::Ping { .. } => Message::Response {
                transaction_id,
                response: Response {
                    id: Some(own_id),
                    ..Response::default()
                },
            },
            Query::FindNode { target, .. } => Message::Response {
                transaction_id,
                response: Response {
                    id: Some(own_id),
                    nodes: self.closest_compact(target),
                    ..Response::default()
                },
            },
            Query::GetPeers { info_hash, .. } => {
                let mut token = vec![0u8; 8];
                rand::rng().fill(&mut token[..]);
                Message::Response {
                    transaction_id,
                    response: Response {
                        id: Some(own_id),
                        token: Some(token),
                        nodes: self.closest_compact(&NodeId::from(*info_hash)),
                        ..Response::default()
                    },
                }
            }
            Query::AnnouncePeer { .. } => Message::Response {
                transaction_id,
                response: Response {
                    id: Some(own_id),
                    ..Response::default()
                },
            },
            Query::Unknown { method } => {
                tracing::debug!(%from, %method, "unknown KRPC method");
                Message::Error {
                    transaction_id,
                    code: ERROR_METHOD_UNKNOWN,
                    message: "Method Unknown".to_string(),
                }
            }
        };

        // a querying node is a live node
        if let Some(id) = query_sender(&query) {
            self.observe_node(id, from).await;
        }
        self.send_message(&reply, from).await;
    }

    async fn accept_response(
        &mut self,
        transaction_id: &[u8],
        response: Response,
        from: SocketAddr,
    ) {
        let Some(pending) = self.pending.remove(transaction_id) else {
            tracing::trace!(%from, "response with unknown transaction id discarded");
            return;
        };

        if let Some(id) = response.id {
            self.routing.note_response(&id);
            self.observe_node(id, from).await;
            // the incumbent answered, so its challenger is dismissed
            self.replacements.remove(&id);
        }

        match pending.purpose {
            Purpose::Bootstrap => {
                for node in &response.nodes {
                    self.observe_node(node.id, node.addr).await;
                }
                tracing::debug!(table = self.routing.len(), "bootstrap response merged");
            }
            Purpose::LookupGetPeers { lookup } => {
                if let Some(entry) = self.lookups.get_mut(&lookup) {
                    let from_id = response.id.or(pending.node_id);
                    if let Some(from_id) = from_id {
                        entry.state.record_response(
                            from_id,
                            &response.nodes,
                            &response.values,
                            response.token.clone(),
                            pending.addr,
                        );
                    }
                    entry.pending = entry.pending.saturating_sub(1);
                    if entry.pending == 0 {
                        self.advance_lookup(lookup).await;
                    }
                }
                for node in &response.nodes {
                    self.observe_node(node.id, node.addr).await;
                }
            }
            Purpose::MaintenancePing { .. } | Purpose::Announce => {}
        }
    }

    /// Offers a node to the routing table, pinging the incumbent when
    /// its bucket is full.
    async fn observe_node(&mut self, id: NodeId, addr: SocketAddr) {
        match self.routing.record(id, addr) {
            Insert::Stored | Insert::Own => {}
            Insert::BucketFull {
                least_recently_seen: (incumbent, incumbent_addr),
            } => {
                if self.replacements.contains_key(&incumbent) {
                    return;
                }
                self.replacements.insert(incumbent, (id, addr));
                let own_id = self.routing.own_id();
                self.send_query(
                    Query::Ping { id: own_id },
                    Some(incumbent),
                    incumbent_addr,
                    Purpose::MaintenancePing { target: incumbent },
                )
                .await;
            }
        }
    }

    /// Times out overdue queries. A timeout counts one failure against
    /// the node; eviction needs three in a row.
    async fn sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|(_, pending)| now >= pending.deadline)
            .map(|(transaction_id, _)| transaction_id.clone())
            .collect();
        for transaction_id in expired {
            if let Some(pending) = self.pending.remove(&transaction_id) {
                self.note_query_failed(pending).await;
            }
        }

        // lookups can also hit their overall deadline while idle
        let overdue: Vec<u64> = self
            .lookups
            .iter()
            .filter(|(_, lookup)| lookup.pending == 0 || now >= lookup.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in overdue {
            if self.lookups.get(&id).is_some_and(|l| l.pending == 0) {
                self.advance_lookup(id).await;
            } else {
                self.finish_lookup(id).await;
            }
        }
    }

    async fn note_query_failed(&mut self, pending: PendingQuery) {
        if let Some(node_id) = pending.node_id {
            let evicted = self.routing.note_failure(&node_id);
            match pending.purpose {
                Purpose::MaintenancePing { target } => {
                    if evicted {
                        // the incumbent is gone, seat the challenger
                        if let Some((candidate, candidate_addr)) =
                            self.replacements.remove(&target)
                        {
                            self.routing.record(candidate, candidate_addr);
                        }
                    } else {
                        let own_id = self.routing.own_id();
                        self.send_query(
                            Query::Ping { id: own_id },
                            Some(target),
                            pending.addr,
                            Purpose::MaintenancePing { target },
                        )
                        .await;
                    }
                    return;
                }
                _ => {}
            }
        }
        if let Purpose::LookupGetPeers { lookup } = pending.purpose {
            if let Some(entry) = self.lookups.get_mut(&lookup) {
                entry.pending = entry.pending.saturating_sub(1);
                if entry.pending == 0 {
                    self.advance_lookup(lookup).await;
                }
            }
        }
    }

    async fn send_query(
        &mut self,
        query: Query,
        node_id: Option<NodeId>,
        addr: SocketAddr,
        purpose: Purpose,
    ) {
        let transaction_id = self.next_transaction.to_be_bytes().to_vec();
        self.next_transaction = self.next_transaction.wrapping_add(1);
        let message = Message::Query {
            transaction_id: transaction_id.clone(),
            query,
        };
        self.pending.insert(
            transaction_id,
            PendingQuery {
                node_id,
                addr,
                deadline: Instant::now() + self.query_timeout,
                purpose,
            },
        );
        self.send_message(&message, addr).await;
    }

    async fn send_message(&self, message: &Message, addr: SocketAddr) {
        match message.encode() {
            Ok(datagram) => {
                if let Err(e) = self.socket.send_to(&datagram, addr).await {
                    tracing::debug!(%addr, error = %e, "DHT send failed");
                }
            }
            Err(e) => tracing::debug!(error = %e, "failed to encode KRPC message"),
        }
    }

    fn closest_compact(&self, target: &NodeId) -> Vec<CompactNode> {
        self.routing
            .closest(target, BUCKET_SIZE)
            .into_iter()
            .map(|(id, addr)| CompactNode { id, addr })
            .collect()
    }
}

fn query_sender(query: &Query) -> Option<NodeId> {
    match query {
        Query::Ping { id }
        | Query::FindNode { id, .. }
        | Query::GetPeers { id, .. }
        | Query::AnnouncePeer { id, .. } => Some(*id),
        Query::Unknown { .. } => None,
    }
}

/// Pure state of one iterative lookup.
///
/// Candidates are kept sorted by distance to the target. A round
/// queries up to alpha unqueried candidates; the lookup converges when
/// no unqueried candidate is closer than the closest node that has
/// already responded.
pub(crate) struct LookupState {
    target: NodeId,
    candidates: Vec<(NodeId, SocketAddr)>,
    queried: HashSet<NodeId>,
    peers: HashSet<SocketAddr>,
    tokens: Vec<(NodeId, SocketAddr, Vec<u8>)>,
    closest_responder: Option<Distance>,
    rounds: usize,
}

impl LookupState {
    pub(crate) fn new(target: NodeId, seeds: Vec<(NodeId, SocketAddr)>) -> Self {
        let mut state = LookupState {
            target,
            candidates: Vec::new(),
            queried: HashSet::new(),
            peers: HashSet::new(),
            tokens: Vec::new(),
            closest_responder: None,
            rounds: 0,
        };
        state.add_candidates(seeds);
        state
    }

    fn add_candidates(&mut self, nodes: Vec<(NodeId, SocketAddr)>) {
        for (id, addr) in nodes {
            if self.candidates.iter().any(|(existing, _)| *existing == id) {
                continue;
            }
            self.candidates.push((id, addr));
        }
        let target = self.target;
        self.candidates.sort_by_key(|(id, _)| id.distance(&target));
    }

    /// Picks the next batch to query, or an empty batch when the
    /// lookup is done (converged or out of rounds).
    pub(crate) fn next_round(&mut self, alpha: usize) -> Vec<(NodeId, SocketAddr)> {
        if self.rounds >= MAX_ROUNDS {
            return Vec::new();
        }
        let batch: Vec<(NodeId, SocketAddr)> = self
            .candidates
            .iter()
            .filter(|(id, _)| !self.queried.contains(id))
            .filter(|(id, _)| match &self.closest_responder {
                Some(best) => id.distance(&self.target) < *best,
                None => true,
            })
            .take(alpha)
            .copied()
            .collect();
        if batch.is_empty() {
            return batch;
        }
        self.rounds += 1;
        for (id, _) in &batch {
            self.queried.insert(*id);
        }
        batch
    }

    pub(crate) fn record_response(
        &mut self,
        from: NodeId,
        nodes: &[CompactNode],
        values: &[SocketAddr],
        token: Option<Vec<u8>>,
        from_addr: SocketAddr,
    ) {
        let distance = from.distance(&self.target);
        if self
            .closest_responder
            .map_or(true, |best| distance < best)
        {
            self.closest_responder = Some(distance);
        }
        self.add_candidates(nodes.iter().map(|node| (node.id, node.addr)).collect());
        self.peers.extend(values.iter().copied());
        if let Some(token) = token {
            self.tokens.push((from, from_addr, token));
        }
    }

    pub(crate) fn peers(&self) -> Vec<SocketAddr> {
        self.peers.iter().copied().collect()
    }

    /// Token holders ordered by distance, for the announce that may
    /// follow a lookup.
    pub(crate) fn closest_token_holders(&self, count: usize) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut holders = self.tokens.clone();
        let target = self.target;
        holders.sort_by_key(|(id, _, _)| id.distance(&target));
        holders
            .into_iter()
            .take(count)
            .map(|(_, addr, token)| (addr, token))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(bytes: [u8; 20]) -> NodeId {
        NodeId::from(bytes)
    }

    fn byte_id(last: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        id(bytes)
    }

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:6881").parse().unwrap()
    }

    fn compact(node_id: NodeId, peer_addr: SocketAddr) -> CompactNode {
        CompactNode {
            id: node_id,
            addr: peer_addr,
        }
    }

    #[test]
    fn lookup_terminates_when_nothing_gets_closer() {
        let target = id([0u8; 20]);
        // seed at distance 0x10
        let seed = byte_id(0x10);
        let mut state = LookupState::new(target, vec![(seed, addr(1))]);

        let round = state.next_round(ALPHA);
        assert_eq!(round, vec![(seed, addr(1))]);

        // the seed only knows nodes farther away than itself
        state.record_response(
            seed,
            &[
                compact(byte_id(0x20), addr(2)),
                compact(byte_id(0x30), addr(3)),
            ],
            &[],
            None,
            addr(1),
        );

        assert!(state.next_round(ALPHA).is_empty());
        assert!(state.peers().is_empty());
    }

    #[test]
    fn lookup_chases_closer_nodes() {
        let target = id([0u8; 20]);
        let seed = byte_id(0x40);
        let closer = byte_id(0x04);
        let mut state = LookupState::new(target, vec![(seed, addr(1))]);

        assert_eq!(state.next_round(ALPHA).len(), 1);
        state.record_response(seed, &[compact(closer, addr(2))], &[], None, addr(1));

        // the closer node is queried next
        assert_eq!(state.next_round(ALPHA), vec![(closer, addr(2))]);
        state.record_response(
            closer,
            &[],
            &["192.0.2.1:6881".parse().unwrap()],
            Some(b"tok".to_vec()),
            addr(2),
        );

        assert!(state.next_round(ALPHA).is_empty());
        assert_eq!(state.peers(), vec!["192.0.2.1:6881".parse().unwrap()]);
        assert_eq!(
            state.closest_token_holders(8),
            vec![(addr(2), b"tok".to_vec())]
        );
    }

    #[test]
    fn lookup_respects_alpha_and_round_limit() {
        let target = id([0u8; 20]);
        // more candidates than MAX_ROUNDS rounds can consume
        let seeds: Vec<(NodeId, SocketAddr)> =
            (1..=20).map(|i| (byte_id(i), addr(i))).collect();
        let mut state = LookupState::new(target, seeds);

        let first = state.next_round(ALPHA);
        assert_eq!(first.len(), ALPHA);
        // closest first
        assert_eq!(first[0].0, byte_id(1));

        // no responses arrive; the round cap ends the lookup
        for _ in 1..MAX_ROUNDS {
            let batch = state.next_round(ALPHA);
            assert_eq!(batch.len(), ALPHA);
        }
        assert!(state.next_round(ALPHA).is_empty());
    }

    #[test]
    fn duplicate_peers_and_nodes_collapse() {
        let target = id([0u8; 20]);
        let seed = byte_id(0x10);
        let mut state = LookupState::new(target, vec![(seed, addr(1))]);
        state.next_round(ALPHA);

        let peer: SocketAddr = "192.0.2.9:6881".parse().unwrap();
        state.record_response(seed, &[compact(seed, addr(1))], &[peer, peer], None, addr(1));
        assert_eq!(state.peers().len(), 1);
        assert_eq!(state.candidates.len(), 1);
    }

    #[tokio::test]
    async fn empty_table_lookup_resolves_immediately() {
        let handle = spawn(0, Duration::from_millis(100)).await.unwrap();
        let peers = handle.find_peers(InfoHash::from([9u8; 20])).await.unwrap();
        assert!(peers.is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn answers_inbound_ping_and_get_peers() {
        let handle = spawn(0, Duration::from_millis(100)).await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = format!("127.0.0.1:{}", handle.local_addr().port());

        let ping = Message::Query {
            transaction_id: b"t1".to_vec(),
            query: Query::Ping {
                id: byte_id(1),
            },
        };
        client
            .send_to(&ping.encode().unwrap(), &server)
            .await
            .unwrap();
        let mut buf = [0u8; 2048];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        match Message::decode(&buf[..len]).unwrap() {
            Message::Response {
                transaction_id,
                response,
            } => {
                assert_eq!(transaction_id, b"t1");
                assert!(response.id.is_some());
            }
            other => panic!("expected response, got {other:?}"),
        }

        let get_peers = Message::Query {
            transaction_id: b"t2".to_vec(),
            query: Query::GetPeers {
                id: byte_id(2),
                info_hash: InfoHash::from([5u8; 20]),
            },
        };
        client
            .send_to(&get_peers.encode().unwrap(), &server)
            .await
            .unwrap();
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        match Message::decode(&buf[..len]).unwrap() {
            Message::Response { response, .. } => {
                assert!(response.token.is_some());
                // the pinging node from above is in the table by now
                assert!(!response.nodes.is_empty());
            }
            other => panic!("expected response, got {other:?}"),
        }
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_methods_get_error_204() {
        let handle = spawn(0, Duration::from_millis(100)).await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = format!("127.0.0.1:{}", handle.local_addr().port());

        let raw = format!("d1:ad2:id20:{}e1:q4:vote1:t2:tx1:y1:qe", "q".repeat(20));
        client.send_to(raw.as_bytes(), &server).await.unwrap();
        let mut buf = [0u8; 2048];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        match Message::decode(&buf[..len]).unwrap() {
            Message::Error { code, .. } => assert_eq!(code, ERROR_METHOD_UNKNOWN),
            other => panic!("expected error, got {other:?}"),
        }
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn lookup_queries_known_nodes_and_collects_values() {
        let handle = spawn(0, Duration::from_millis(200)).await.unwrap();
        let server = format!("127.0.0.1:{}", handle.local_addr().port());

        // a fake remote node that answers get_peers with one value
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_id = byte_id(0x33);
        let ping = Message::Query {
            transaction_id: b"hi".to_vec(),
            query: Query::Ping { id: remote_id },
        };
        remote
            .send_to(&ping.encode().unwrap(), &server)
            .await
            .unwrap();
        let mut buf = [0u8; 2048];
        let _ = remote.recv_from(&mut buf).await.unwrap(); // pong

        let remote_task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (len, from) = remote.recv_from(&mut buf).await.unwrap();
            let message = Message::decode(&buf[..len]).unwrap();
            let Message::Query {
                transaction_id,
                query: Query::GetPeers { .. },
            } = message
            else {
                panic!("expected get_peers, got {message:?}");
            };
            let reply = Message::Response {
                transaction_id,
                response: Response {
                    id: Some(remote_id),
                    token: Some(b"tk".to_vec()),
                    values: vec!["198.51.100.2:6881".parse().unwrap()],
                    ..Response::default()
                },
            };
            remote
                .send_to(&reply.encode().unwrap(), from)
                .await
                .unwrap();
        });

        let peers = handle.find_peers(InfoHash::from([5u8; 20])).await.unwrap();
        assert_eq!(peers, vec!["198.51.100.2:6881".parse().unwrap()]);
        remote_task.await.unwrap();
        handle.shutdown().await;
    }
}
