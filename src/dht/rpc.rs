//! The DHT RPC manager.
//!
//! Owns every outstanding query as an [`Observer`] in a list ordered by
//! send time. Transaction ids are a wrap-around 16-bit counter; reuse is
//! safe because observer lifetimes are bounded by the hard timeout.
//! Replies match on (transaction id, source address) — a known id from
//! the wrong address is dropped, an unknown id draws a bencoded
//! "invalid transaction id" error.
//!
//! Two timeouts per observer: the short timeout reports the node as slow
//! so its traversal may widen its branch factor (sent once, never
//! reset), and the hard timeout fails the observer. The RPC layer never
//! retries; retry policy belongs to the traversal.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use super::message::{invalid_transaction_error, KrpcMessage, Query, Reply};
use super::node::NodeId;
use super::traversal::TraversalId;
use crate::constants::{DHT_HARD_TIMEOUT, DHT_SHORT_TIMEOUT, MAX_TRANSACTION_ID};

/// What kind of traversal step an observer represents. The original
/// dispatched on observer subtype; a closed enum covers the same set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverKind {
    /// A find_node / get_peers lookup step.
    FindData,
    /// An announce_peer write.
    Announce,
    /// Fire-and-forget (ping); no traversal cares about the outcome.
    Null,
}

/// One outstanding RPC.
#[derive(Debug)]
pub struct Observer {
    pub kind: ObserverKind,
    pub traversal: TraversalId,
    pub target: SocketAddr,
    pub transaction_id: u16,
    pub sent: Instant,
    done: bool,
    short_timeout: bool,
}

impl Observer {
    pub fn has_short_timeout(&self) -> bool {
        self.short_timeout
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Latches the short timeout; returns true the first time only.
    fn flag_short_timeout(&mut self) -> bool {
        if self.short_timeout {
            return false;
        }
        self.short_timeout = true;
        true
    }

    /// Latches the terminal state; returns true the first time only.
    fn finish(&mut self) -> bool {
        if self.done {
            return false;
        }
        self.done = true;
        true
    }
}

/// Timeout notifications produced by [`RpcManager::tick`].
#[derive(Debug)]
pub enum TimeoutEvent {
    /// The observer is slow; the traversal may fan out further. The
    /// observer stays queued.
    Short {
        traversal: TraversalId,
        target: SocketAddr,
    },
    /// The observer failed; it has been removed.
    Hard { observer: Observer },
}

/// Outcome of [`RpcManager::incoming`].
#[derive(Debug)]
pub enum IncomingOutcome {
    /// The reply matched; the observer has been removed.
    Matched { observer: Observer, reply: Reply },
    /// Unknown transaction id; send this error reply back.
    UnknownTransaction { error: Vec<u8> },
    /// Known id but wrong source address, or a malformed reply: drop.
    Dropped,
}

pub struct RpcManager {
    our_id: NodeId,
    next_transaction_id: u16,
    /// Ordered by send time: new observers go on the back, so timeout
    /// walks can stop at the first observer that has not expired.
    transactions: VecDeque<Observer>,
    aborted: bool,
}

impl RpcManager {
    pub fn new(our_id: NodeId) -> Self {
        Self {
            our_id,
            next_transaction_id: rand::random::<u16>() % MAX_TRANSACTION_ID,
            transactions: VecDeque::new(),
            aborted: false,
        }
    }

    pub fn our_id(&self) -> NodeId {
        self.our_id
    }

    pub fn num_outstanding(&self) -> usize {
        self.transactions.len()
    }

    /// Builds and registers one query. Returns the encoded packet to put
    /// on the wire, or `None` after abort.
    pub fn invoke(
        &mut self,
        query: Query,
        target: SocketAddr,
        kind: ObserverKind,
        traversal: TraversalId,
        now: Instant,
    ) -> Option<Vec<u8>> {
        if self.aborted {
            return None;
        }

        let tid = self.next_transaction_id;
        self.next_transaction_id = (self.next_transaction_id + 1) % MAX_TRANSACTION_ID;

        let packet = KrpcMessage::Query {
            tid: Bytes::copy_from_slice(&tid.to_be_bytes()),
            id: self.our_id,
            query,
        }
        .encode();

        trace!(tid, %target, "dht invoke");
        self.transactions.push_back(Observer {
            kind,
            traversal,
            target,
            transaction_id: tid,
            sent: now,
            done: false,
            short_timeout: false,
        });
        Some(packet)
    }

    /// Matches an incoming message against the transaction list.
    pub fn incoming(&mut self, msg: KrpcMessage, source: SocketAddr) -> IncomingOutcome {
        if self.aborted {
            return IncomingOutcome::Dropped;
        }

        // queries are not ours to match; the node answers them
        let (tid_bytes, reply) = match msg {
            KrpcMessage::Reply { tid, reply } => (tid, reply),
            KrpcMessage::Error { tid, code, message } => {
                debug!(code, %message, %source, "dht error reply");
                // error replies still consume their observer
                (tid, Reply::default())
            }
            KrpcMessage::Query { .. } => return IncomingOutcome::Dropped,
        };

        let Some(tid) = decode_tid(&tid_bytes) else {
            return IncomingOutcome::UnknownTransaction {
                error: invalid_transaction_error(tid_bytes).encode(),
            };
        };

        let position = self
            .transactions
            .iter()
            .position(|o| o.transaction_id == tid);
        match position {
            Some(pos) if self.transactions[pos].target.ip() == source.ip() => {
                let mut observer = self.transactions.remove(pos).expect("position valid");
                observer.finish();
                IncomingOutcome::Matched { observer, reply }
            }
            Some(_) => {
                // transaction id known but the reply came from somewhere
                // else; do not complete the observer
                debug!(tid, %source, "dht reply source mismatch, dropped");
                IncomingOutcome::Dropped
            }
            None => IncomingOutcome::UnknownTransaction {
                error: invalid_transaction_error(tid_bytes).encode(),
            },
        }
    }

    /// Expires observers. Returns the fired events and the duration
    /// until the next deadline, for timer scheduling.
    pub fn tick(&mut self, now: Instant) -> (Vec<TimeoutEvent>, Duration) {
        let mut events = Vec::new();
        let mut next_wakeup = DHT_SHORT_TIMEOUT;

        // hard timeouts: the list is sorted by send time, so stop at the
        // first observer still inside the window
        while let Some(front) = self.transactions.front() {
            let age = now.saturating_duration_since(front.sent);
            if age < DHT_HARD_TIMEOUT {
                next_wakeup = DHT_HARD_TIMEOUT - age;
                break;
            }
            let mut observer = self.transactions.pop_front().expect("front checked");
            debug!(tid = observer.transaction_id, target = %observer.target, "dht hard timeout");
            if observer.finish() {
                events.push(TimeoutEvent::Hard { observer });
            }
        }

        // short timeouts: same walk over what remains
        for observer in &mut self.transactions {
            let age = now.saturating_duration_since(observer.sent);
            if age < DHT_SHORT_TIMEOUT {
                next_wakeup = next_wakeup.min(DHT_SHORT_TIMEOUT - age);
                break;
            }
            if observer.flag_short_timeout() {
                events.push(TimeoutEvent::Short {
                    traversal: observer.traversal,
                    target: observer.target,
                });
            }
        }

        (events, next_wakeup)
    }

    /// A port-unreachable event for `endpoint`: the first outstanding
    /// observer to that endpoint fails immediately.
    pub fn unreachable(&mut self, endpoint: SocketAddr) -> Option<Observer> {
        let pos = self
            .transactions
            .iter()
            .position(|o| o.target == endpoint)?;
        let mut observer = self.transactions.remove(pos).expect("position valid");
        debug!(tid = observer.transaction_id, %endpoint, "dht port unreachable");
        observer.finish();
        Some(observer)
    }

    /// Aborts every outstanding observer; further invokes are refused.
    pub fn abort(&mut self) -> Vec<Observer> {
        self.aborted = true;
        let mut aborted = Vec::with_capacity(self.transactions.len());
        while let Some(mut observer) = self.transactions.pop_front() {
            if observer.finish() {
                aborted.push(observer);
            }
        }
        aborted
    }

    /// Invariant I5: transaction ids are unique within the list.
    #[cfg(debug_assertions)]
    pub fn check_invariants(&self) {
        let mut seen = std::collections::HashSet::new();
        for observer in &self.transactions {
            debug_assert!(
                seen.insert(observer.transaction_id),
                "duplicate transaction id {}",
                observer.transaction_id
            );
            debug_assert!(observer.transaction_id < MAX_TRANSACTION_ID);
            debug_assert!(!observer.done);
        }
    }
}

fn decode_tid(bytes: &Bytes) -> Option<u16> {
    let arr: [u8; 2] = bytes.as_ref().try_into().ok()?;
    Some(u16::from_be_bytes(arr))
}
