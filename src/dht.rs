//! Distributed Hash Table (BEP-5): the RPC layer and the node glue
//! around it.
//!
//! The session engine owns the UDP socket; [`DhtNode`] is fed decoded
//! packets and hands back packets to send. A full Kademlia routing table
//! is out of scope — a bounded table of recently responsive nodes seeds
//! traversals, which own all retry policy on top of the
//! [`rpc::RpcManager`] timeout contract.

pub mod message;
pub mod node;
pub mod rpc;
pub mod traversal;

mod error;

pub use error::DhtError;
pub use node::{NodeId, NodeInfo};

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::bencode::Value;
use crate::meta::InfoHash;
use message::{KrpcMessage, Query, Reply};
use rpc::{IncomingOutcome, ObserverKind, RpcManager, TimeoutEvent};
use traversal::{Traversal, TraversalId, TraversalKind};

const MAX_TABLE_NODES: usize = 160;
const MAX_STORED_PEERS_PER_TORRENT: usize = 200;
const PEER_LIFETIME: Duration = Duration::from_secs(30 * 60);
const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Events the engine consumes from the DHT.
#[derive(Debug)]
pub enum DhtEvent {
    /// A get_peers traversal finished with these peers.
    PeersFound {
        info_hash: InfoHash,
        peers: Vec<SocketAddr>,
    },
    /// The bootstrap traversal finished; the table holds this many nodes.
    Bootstrapped { nodes: usize },
}

struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
    rotated_at: Instant,
}

impl TokenSecrets {
    fn new(now: Instant) -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
            rotated_at: now,
        }
    }

    fn rotate(&mut self, now: Instant) {
        self.previous = self.current;
        self.current = rand::random();
        self.rotated_at = now;
    }

    fn token_for(secret: &[u8; 16], addr: &SocketAddr) -> Bytes {
        let mut hasher = Sha1::new();
        hasher.update(secret);
        hasher.update(addr.ip().to_string().as_bytes());
        Bytes::copy_from_slice(&hasher.finalize()[..8])
    }
}

struct StoredPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

pub struct DhtNode {
    rpc: RpcManager,
    traversals: HashMap<TraversalId, Traversal>,
    next_traversal_id: u64,
    /// Recently responsive nodes, newest last; seeds traversals.
    table: Vec<NodeInfo>,
    token_secrets: TokenSecrets,
    peer_store: HashMap<InfoHash, Vec<StoredPeer>>,
    /// Packets waiting for the engine to put on the UDP socket.
    outgoing: Vec<(Vec<u8>, SocketAddr)>,
    bootstrap: Option<TraversalId>,
    aborted: bool,
}

impl DhtNode {
    pub fn new(our_id: NodeId, now: Instant) -> Self {
        Self {
            rpc: RpcManager::new(our_id),
            traversals: HashMap::new(),
            next_traversal_id: 1,
            table: Vec::new(),
            token_secrets: TokenSecrets::new(now),
            peer_store: HashMap::new(),
            outgoing: Vec::new(),
            bootstrap: None,
            aborted: false,
        }
    }

    pub fn our_id(&self) -> NodeId {
        self.rpc.our_id()
    }

    pub fn num_nodes(&self) -> usize {
        self.table.len()
    }

    /// Drains packets queued for the wire.
    pub fn take_outgoing(&mut self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut self.outgoing)
    }

    // ------------------------------------------------------------------
    // node table
    // ------------------------------------------------------------------

    fn node_seen(&mut self, id: NodeId, addr: SocketAddr) {
        if let Some(pos) = self.table.iter().position(|n| n.addr == addr) {
            self.table.remove(pos);
        }
        self.table.push(NodeInfo { id, addr });
        if self.table.len() > MAX_TABLE_NODES {
            self.table.remove(0);
        }
    }

    fn closest_nodes(&self, target: &NodeId, count: usize) -> Vec<NodeInfo> {
        let mut nodes = self.table.clone();
        nodes.sort_by_key(|n| n.id.distance(target));
        nodes.truncate(count);
        nodes
    }

    /// Adds a node endpoint directly (from `add_dht_node` or a peer's
    /// DHT port message); it gets pinged to learn its id.
    pub fn add_node(&mut self, addr: SocketAddr, now: Instant) {
        if let Some(packet) = self.rpc.invoke(
            Query::Ping,
            addr,
            ObserverKind::Null,
            TraversalId(0),
            now,
        ) {
            self.outgoing.push((packet, addr));
        }
    }

    // ------------------------------------------------------------------
    // lookups
    // ------------------------------------------------------------------

    /// Starts the bootstrap: a find_node toward our own id, seeded with
    /// the given endpoints (ids unknown until they respond).
    pub fn start_bootstrap(&mut self, seeds: Vec<SocketAddr>, now: Instant) {
        let our_id = self.our_id();
        let seed_infos = seeds
            .into_iter()
            .map(|addr| NodeInfo {
                id: NodeId::generate(),
                addr,
            })
            .collect();
        let id = self.allocate_traversal_id();
        let traversal = Traversal::new(id, TraversalKind::FindNode, our_id, seed_infos);
        self.bootstrap = Some(id);
        self.traversals.insert(id, traversal);
        self.pump_traversal(id, now);
        info!("dht bootstrap started");
    }

    /// Starts a get_peers lookup; announces our `port` afterwards when
    /// provided.
    pub fn announce(&mut self, info_hash: InfoHash, port: Option<u16>, now: Instant) {
        let target = NodeId(info_hash.0);
        let seeds = self.closest_nodes(&target, crate::constants::DHT_MAX_RESULTS);
        let id = self.allocate_traversal_id();
        let traversal = Traversal::new(
            id,
            TraversalKind::GetPeers {
                info_hash,
                announce: port,
            },
            target,
            seeds,
        );
        self.traversals.insert(id, traversal);
        self.pump_traversal(id, now);
        debug!(torrent = %info_hash, "dht announce started");
    }

    fn allocate_traversal_id(&mut self) -> TraversalId {
        let id = TraversalId(self.next_traversal_id);
        self.next_traversal_id += 1;
        id
    }

    /// Issues whatever queries a traversal is ready to send.
    fn pump_traversal(&mut self, id: TraversalId, now: Instant) {
        let Some(traversal) = self.traversals.get_mut(&id) else {
            return;
        };
        let queries = traversal.next_queries();
        let kind = ObserverKind::FindData;
        for (query, addr) in queries {
            if let Some(packet) = self.rpc.invoke(query, addr, kind, id, now) {
                self.outgoing.push((packet, addr));
            }
        }
    }

    /// Reaps a finished traversal into events, running its announce
    /// phase first.
    fn finish_traversal(&mut self, id: TraversalId, now: Instant) -> Option<DhtEvent> {
        let traversal = self.traversals.remove(&id)?;
        for (query, addr) in traversal.announce_queries() {
            if let Some(packet) =
                self.rpc
                    .invoke(query, addr, ObserverKind::Announce, TraversalId(0), now)
            {
                self.outgoing.push((packet, addr));
            }
        }
        if self.bootstrap == Some(id) {
            self.bootstrap = None;
            return Some(DhtEvent::Bootstrapped {
                nodes: self.table.len(),
            });
        }
        if let TraversalKind::GetPeers { info_hash, .. } = traversal.kind {
            return Some(DhtEvent::PeersFound {
                info_hash,
                peers: traversal.peers_found.clone(),
            });
        }
        None
    }

    // ------------------------------------------------------------------
    // packet handling
    // ------------------------------------------------------------------

    /// Handles one datagram addressed to the DHT.
    pub fn incoming_packet(
        &mut self,
        data: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Vec<DhtEvent> {
        if self.aborted {
            return Vec::new();
        }
        let msg = match KrpcMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%source, error = %e, "undecodable dht packet");
                return Vec::new();
            }
        };

        match msg {
            KrpcMessage::Query { tid, id, query } => {
                self.node_seen(id, source);
                let reply = self.answer_query(tid, query, source);
                self.outgoing.push((reply, source));
                Vec::new()
            }
            other => {
                match self.rpc.incoming(other, source) {
                    IncomingOutcome::Matched { observer, reply } => {
                        if let Some(id) = reply.id {
                            self.node_seen(id, source);
                        }
                        let mut events = Vec::new();
                        let tid = observer.traversal;
                        let mut done = false;
                        if let Some(traversal) = self.traversals.get_mut(&tid) {
                            traversal.on_reply(source, &reply);
                            done = traversal.is_done();
                        }
                        if done {
                            events.extend(self.finish_traversal(tid, now));
                        } else if self.traversals.contains_key(&tid) {
                            self.pump_traversal(tid, now);
                        }
                        events
                    }
                    IncomingOutcome::UnknownTransaction { error } => {
                        self.outgoing.push((error, source));
                        Vec::new()
                    }
                    IncomingOutcome::Dropped => Vec::new(),
                }
            }
        }
    }

    fn answer_query(&mut self, tid: Bytes, query: Query, source: SocketAddr) -> Vec<u8> {
        let our_id = self.our_id();
        let reply = match query {
            Query::Ping => Reply {
                id: Some(our_id),
                ..Reply::default()
            },
            Query::FindNode { target } => Reply {
                id: Some(our_id),
                nodes: self.closest_nodes(&target, crate::constants::DHT_MAX_RESULTS),
                ..Reply::default()
            },
            Query::GetPeers { info_hash } => {
                let target = NodeId(info_hash.0);
                let token =
                    TokenSecrets::token_for(&self.token_secrets.current, &source);
                let now = Instant::now();
                let peers = self
                    .peer_store
                    .get_mut(&info_hash)
                    .map(|stored| {
                        stored.retain(|p| now.duration_since(p.announced_at) < PEER_LIFETIME);
                        stored.iter().map(|p| p.addr).collect()
                    })
                    .unwrap_or_default();
                Reply {
                    id: Some(our_id),
                    nodes: self.closest_nodes(&target, crate::constants::DHT_MAX_RESULTS),
                    peers,
                    token: Some(token),
                }
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
            } => {
                if !self.validate_token(&token, &source) {
                    return KrpcMessage::Error {
                        tid,
                        code: 203,
                        message: "invalid token".to_string(),
                    }
                    .encode();
                }
                let peer_port = if implied_port { source.port() } else { port };
                let peer_addr = SocketAddr::new(source.ip(), peer_port);
                let stored = self.peer_store.entry(info_hash).or_default();
                stored.retain(|p| p.addr != peer_addr);
                if stored.len() < MAX_STORED_PEERS_PER_TORRENT {
                    stored.push(StoredPeer {
                        addr: peer_addr,
                        announced_at: Instant::now(),
                    });
                }
                Reply {
                    id: Some(our_id),
                    ..Reply::default()
                }
            }
        };
        KrpcMessage::Reply { tid, reply }.encode()
    }

    fn validate_token(&self, token: &Bytes, source: &SocketAddr) -> bool {
        *token == TokenSecrets::token_for(&self.token_secrets.current, source)
            || *token == TokenSecrets::token_for(&self.token_secrets.previous, source)
    }

    // ------------------------------------------------------------------
    // timers
    // ------------------------------------------------------------------

    /// Drives RPC timeouts and traversal progress. Called every engine
    /// tick.
    pub fn tick(&mut self, now: Instant) -> Vec<DhtEvent> {
        if self.aborted {
            return Vec::new();
        }
        if now.duration_since(self.token_secrets.rotated_at) >= TOKEN_ROTATE_INTERVAL {
            self.token_secrets.rotate(now);
        }

        let (timeouts, _next_wakeup) = self.rpc.tick(now);
        let mut touched = Vec::new();
        for event in timeouts {
            match event {
                TimeoutEvent::Short { traversal, target } => {
                    if let Some(t) = self.traversals.get_mut(&traversal) {
                        t.failed(target, true);
                        touched.push(traversal);
                    }
                }
                TimeoutEvent::Hard { observer } => {
                    if let Some(t) = self.traversals.get_mut(&observer.traversal) {
                        t.failed(observer.target, false);
                        touched.push(observer.traversal);
                    }
                }
            }
        }

        let mut events = Vec::new();
        touched.sort_by_key(|t| t.0);
        touched.dedup();
        for id in touched {
            let done = self
                .traversals
                .get(&id)
                .map(|t| t.is_done())
                .unwrap_or(false);
            if done {
                events.extend(self.finish_traversal(id, now));
            } else {
                self.pump_traversal(id, now);
            }
        }

        #[cfg(debug_assertions)]
        self.rpc.check_invariants();

        events
    }

    /// ICMP port-unreachable for `endpoint`.
    pub fn unreachable(&mut self, endpoint: SocketAddr, now: Instant) -> Vec<DhtEvent> {
        let Some(observer) = self.rpc.unreachable(endpoint) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        let tid = observer.traversal;
        let mut done = false;
        if let Some(t) = self.traversals.get_mut(&tid) {
            t.failed(endpoint, false);
            done = t.is_done();
        }
        if done {
            events.extend(self.finish_traversal(tid, now));
        } else if self.traversals.contains_key(&tid) {
            self.pump_traversal(tid, now);
        }
        events
    }

    /// Aborts everything; no further packets are produced.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.rpc.abort();
        self.traversals.clear();
        self.outgoing.clear();
    }

    // ------------------------------------------------------------------
    // persisted state
    // ------------------------------------------------------------------

    /// The `dht state` section of the session state.
    pub fn save_state(&self) -> Value {
        let mut state = Value::dict();
        state.insert(b"node-id", Value::bytes(&self.our_id().0));
        state.insert(
            b"nodes",
            Value::Str(node::encode_compact_nodes(&self.table).freeze()),
        );
        state
    }

    /// Restores the node table from a saved `dht state` section. The
    /// node id is owned by the caller (it decides whether to reuse it).
    pub fn load_state(&mut self, state: &Value) {
        if let Some(nodes) = state.get_bytes(b"nodes") {
            for info in node::parse_compact_nodes(nodes) {
                self.table.push(info);
            }
            self.table.truncate(MAX_TABLE_NODES);
        }
    }
}
