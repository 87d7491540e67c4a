//! Traversal algorithms: iterative lookups over the DHT.
//!
//! A traversal owns the retry policy the RPC layer deliberately lacks:
//! it keeps a candidate set sorted by distance to the target, queries the
//! closest unqueried nodes up to its branch factor, widens the branch
//! factor while nodes are flagged slow (short timeout), and re-queries
//! other candidates when nodes fail hard. It finishes when the closest
//! [`DHT_MAX_RESULTS`] candidates have all responded or failed.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;

use super::message::{Query, Reply};
use super::node::{NodeId, NodeInfo};
use crate::constants::{DHT_BRANCH_FACTOR, DHT_MAX_RESULTS};
use crate::meta::InfoHash;

/// Stable identifier of a traversal within the DHT node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraversalId(pub u64);

/// What the traversal is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraversalKind {
    /// Populate the candidate table (bootstrap / refresh).
    FindNode,
    /// Find peers for a torrent; announces afterwards when `announce`
    /// carries our listen port.
    GetPeers {
        info_hash: InfoHash,
        announce: Option<u16>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    New,
    Queried,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    info: NodeInfo,
    state: CandidateState,
    slow: bool,
}

/// An iterative lookup in progress.
pub struct Traversal {
    pub id: TraversalId,
    pub kind: TraversalKind,
    target: NodeId,
    candidates: Vec<Candidate>,
    /// Queries in flight.
    outstanding: usize,
    /// Extra parallelism granted while queried nodes are slow.
    slow_count: usize,
    /// Peers discovered (get_peers only).
    pub peers_found: Vec<SocketAddr>,
    /// Write tokens per responded node, for the announce phase.
    tokens: HashMap<SocketAddr, Bytes>,
    done: bool,
}

impl Traversal {
    pub fn new(id: TraversalId, kind: TraversalKind, target: NodeId, seeds: Vec<NodeInfo>) -> Self {
        let mut traversal = Self {
            id,
            kind,
            target,
            candidates: Vec::new(),
            outstanding: 0,
            slow_count: 0,
            peers_found: Vec::new(),
            tokens: HashMap::new(),
            done: false,
        };
        for seed in seeds {
            traversal.add_candidate(seed);
        }
        traversal
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    fn add_candidate(&mut self, info: NodeInfo) {
        if self.candidates.iter().any(|c| c.info.addr == info.addr) {
            return;
        }
        self.candidates.push(Candidate {
            info,
            state: CandidateState::New,
            slow: false,
        });
        let target = self.target;
        self.candidates
            .sort_by_key(|c| c.info.id.distance(&target));
    }

    /// The effective branch factor: the base plus one per slow node, so
    /// a stalled query does not stall the lookup.
    fn branch_factor(&self) -> usize {
        DHT_BRANCH_FACTOR + self.slow_count
    }

    /// Queries to issue now: closest unqueried candidates up to the
    /// branch factor, minus what is already in flight.
    pub fn next_queries(&mut self) -> Vec<(Query, SocketAddr)> {
        if self.done {
            return Vec::new();
        }
        let budget = self.branch_factor().saturating_sub(self.outstanding);
        let mut queries = Vec::new();
        for candidate in self
            .candidates
            .iter_mut()
            .filter(|c| c.state == CandidateState::New)
            .take(budget)
        {
            candidate.state = CandidateState::Queried;
            let query = match &self.kind {
                TraversalKind::FindNode => Query::FindNode {
                    target: self.target,
                },
                TraversalKind::GetPeers { info_hash, .. } => Query::GetPeers {
                    info_hash: *info_hash,
                },
            };
            queries.push((query, candidate.info.addr));
        }
        self.outstanding += queries.len();
        queries
    }

    /// A reply arrived from `source`. Replies without a sender id (error
    /// replies) count as failures.
    pub fn on_reply(&mut self, source: SocketAddr, reply: &Reply) {
        if reply.id.is_none() {
            self.failed(source, false);
            return;
        }
        if let Some(candidate) = self.candidates.iter_mut().find(|c| c.info.addr == source) {
            if candidate.state == CandidateState::Queried {
                self.outstanding = self.outstanding.saturating_sub(1);
                if candidate.slow {
                    self.slow_count = self.slow_count.saturating_sub(1);
                }
            }
            candidate.state = CandidateState::Responded;
        }
        for node in &reply.nodes {
            self.add_candidate(*node);
        }
        self.peers_found.extend(reply.peers.iter().copied());
        if let Some(token) = &reply.token {
            self.tokens.insert(source, token.clone());
        }
        self.check_done();
    }

    /// A queried node failed (hard timeout, unreachable) or was flagged
    /// slow (`short == true`). Short timeouts only widen the branch
    /// factor; they are reported at most once per node by the RPC layer.
    pub fn failed(&mut self, endpoint: SocketAddr, short: bool) {
        let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|c| c.info.addr == endpoint)
        else {
            return;
        };
        if short {
            if candidate.state == CandidateState::Queried && !candidate.slow {
                candidate.slow = true;
                self.slow_count += 1;
            }
            return;
        }
        if candidate.state == CandidateState::Queried {
            self.outstanding = self.outstanding.saturating_sub(1);
            if candidate.slow {
                candidate.slow = false;
                self.slow_count = self.slow_count.saturating_sub(1);
            }
        }
        candidate.state = CandidateState::Failed;
        self.check_done();
    }

    fn check_done(&mut self) {
        if self.done {
            return;
        }
        // done when the closest DHT_MAX_RESULTS candidates are settled
        // and nothing is in flight toward them
        let settled = self
            .candidates
            .iter()
            .take(DHT_MAX_RESULTS)
            .all(|c| matches!(c.state, CandidateState::Responded | CandidateState::Failed));
        let any_new = self
            .candidates
            .iter()
            .any(|c| c.state == CandidateState::New);
        if (settled && self.outstanding == 0) || (!any_new && self.outstanding == 0) {
            self.done = true;
        }
    }

    /// The announce phase: one announce_peer per responded node that
    /// handed us a token, closest first. Empty unless this is a
    /// get_peers traversal with announce enabled.
    pub fn announce_queries(&self) -> Vec<(Query, SocketAddr)> {
        let TraversalKind::GetPeers {
            info_hash,
            announce: Some(port),
        } = &self.kind
        else {
            return Vec::new();
        };
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .take(DHT_MAX_RESULTS)
            .filter_map(|c| {
                let token = self.tokens.get(&c.info.addr)?.clone();
                Some((
                    Query::AnnouncePeer {
                        info_hash: *info_hash,
                        port: *port,
                        implied_port: false,
                        token,
                    },
                    c.info.addr,
                ))
            })
            .collect()
    }

    /// Closest responded nodes, for refreshing the node table.
    pub fn responded_nodes(&self) -> Vec<NodeInfo> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .take(DHT_MAX_RESULTS)
            .map(|c| c.info)
            .collect()
    }
}
