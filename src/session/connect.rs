//! The connection attempt pump.
//!
//! Each tick the session hands out up to `connection_speed` outbound
//! connect attempts, round-robining between the want-peers-download and
//! want-peers-finished lists so every torrent is equally likely to get a
//! peer, with every n-th attempt going to a finished torrent. A
//! prioritized queue (tracker boosts) short-circuits the rotation.

use std::collections::VecDeque;

use crate::meta::InfoHash;

/// What one attempt produced, reported back by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// A connect was initiated.
    Connected,
    /// The torrent had no usable candidate; try another torrent.
    NoCandidate,
    /// Resources ran out (socket or memory); the pump stops and asks
    /// the engine to clamp the global connection limit.
    OutOfResources,
}

/// Result of one pump run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PumpOutcome {
    pub attempts: usize,
    /// Lower `connections_limit` to `max(2, current connections)`.
    pub clamp_connections_limit: bool,
}

/// Inputs the pump needs each tick.
pub struct PumpContext<'a> {
    pub want_download: &'a [InfoHash],
    pub want_finished: &'a [InfoHash],
    pub connection_speed: usize,
    pub connections_limit: usize,
    pub num_connections: usize,
    /// Free half-open gate slots.
    pub free_slots: usize,
    pub connect_seed_every_n: usize,
}

#[derive(Debug, Default)]
pub struct ConnectPump {
    next_download: usize,
    next_finished: usize,
    downloads_since_seed: usize,
    /// Boosted torrents with remaining attempt counts.
    prioritized: VecDeque<(InfoHash, usize)>,
    /// Connects made outside the pump (tracker boost) to deduct from
    /// this tick's budget.
    boost_connections: usize,
}

impl ConnectPump {
    pub fn new() -> Self {
        Self::default()
    }

    /// Front-of-queue priority for a torrent, typically after a tracker
    /// response delivered fresh peers.
    pub fn prioritize(&mut self, hash: InfoHash, attempts: usize) {
        if self.prioritized.iter().any(|(h, _)| *h == hash) {
            return;
        }
        self.prioritized.push_back((hash, attempts));
    }

    /// Records an immediate boost connect so the next tick's budget
    /// shrinks accordingly.
    pub fn on_boost_connection(&mut self) {
        self.boost_connections += 1;
    }

    /// Runs one tick of attempts. `try_connect` dials one peer for the
    /// given torrent and reports what happened.
    pub fn run(
        &mut self,
        ctx: &PumpContext<'_>,
        mut try_connect: impl FnMut(InfoHash) -> AttemptOutcome,
    ) -> PumpOutcome {
        let mut outcome = PumpOutcome::default();

        if ctx.num_connections >= ctx.connections_limit {
            return outcome;
        }
        let mut budget = ctx.connection_speed;

        // boost connections already used part of this second's budget
        if self.boost_connections > 0 {
            let deduct = self.boost_connections.min(budget);
            budget -= deduct;
            self.boost_connections -= deduct;
        }

        let mut free_slots = ctx.free_slots;
        let num_torrents = ctx.want_download.len() + ctx.want_finished.len();
        if budget == 0 || free_slots == 0 {
            return outcome;
        }
        if num_torrents == 0 && self.prioritized.is_empty() {
            return outcome;
        }

        let mut steps_since_connect = 0usize;
        loop {
            if self.next_download >= ctx.want_download.len() {
                self.next_download = 0;
            }
            if self.next_finished >= ctx.want_finished.len() {
                self.next_finished = 0;
            }

            // prioritized torrents short-circuit the rotation
            let mut torrent = None;
            while let Some((hash, remaining)) = self.prioritized.front_mut() {
                if *remaining == 0 {
                    self.prioritized.pop_front();
                    continue;
                }
                *remaining -= 1;
                torrent = Some(*hash);
                break;
            }

            let torrent = match torrent {
                Some(t) => t,
                None => {
                    let pick_seed = ctx.connect_seed_every_n > 0
                        && self.downloads_since_seed >= ctx.connect_seed_every_n
                        && !ctx.want_finished.is_empty();
                    if pick_seed || ctx.want_download.is_empty() {
                        if ctx.want_finished.is_empty() {
                            break;
                        }
                        let t = ctx.want_finished[self.next_finished];
                        self.next_finished += 1;
                        self.downloads_since_seed = 0;
                        t
                    } else {
                        let t = ctx.want_download[self.next_download];
                        self.next_download += 1;
                        self.downloads_since_seed += 1;
                        t
                    }
                }
            };

            match try_connect(torrent) {
                AttemptOutcome::Connected => {
                    outcome.attempts += 1;
                    budget -= 1;
                    free_slots = free_slots.saturating_sub(1);
                    steps_since_connect = 0;
                }
                AttemptOutcome::NoCandidate => {
                    steps_since_connect += 1;
                }
                AttemptOutcome::OutOfResources => {
                    outcome.clamp_connections_limit = true;
                    return outcome;
                }
            }

            if budget == 0 || free_slots == 0 {
                break;
            }
            // a full lap without a single connect means nobody has
            // candidates; stop rather than spin
            if steps_since_connect > num_torrents + 1 {
                break;
            }
            if ctx.num_connections + outcome.attempts >= ctx.connections_limit {
                break;
            }
        }

        outcome
    }
}
