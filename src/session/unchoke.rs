//! The unchoke scheduler.
//!
//! Every `unchoke_interval` the engine snapshots its connections into
//! [`UnchokeCandidate`]s and runs one of three chokers over them. The
//! decisions come back as plain lists so the engine can apply them to
//! the real connections; keeping the ranking pure makes the choking
//! invariant directly testable.
//!
//! A reserved subset of slots rotates optimistically: after a random
//! shuffle (to break ties fairly), the candidates least recently granted
//! an optimistic unchoke win. Peers promoted into the regular set during
//! a round stop counting as optimistic.

use rand::seq::SliceRandom;

use super::settings::{ChokerMode, SessionSettings};
use crate::constants::{
    BITTYRANT_DEFAULT_CAPACITY, BITTYRANT_PEAK_HEADROOM, RATE_CHOKER_STEP,
};
use crate::peer::ConnId;

/// Snapshot of one connection, taken at the start of a choke round.
#[derive(Debug, Clone)]
pub struct UnchokeCandidate {
    pub conn: ConnId,
    pub interested: bool,
    /// We are currently choking this peer.
    pub choked: bool,
    pub connecting: bool,
    pub disconnecting: bool,
    pub torrent_paused: bool,
    pub ignore_unchoke_slots: bool,
    pub optimistically_unchoked: bool,
    /// Session-time seconds of the last optimistic grant.
    pub last_optimistic_unchoke: u64,
    /// Ranking rate: upload to the peer while seeding, download from it
    /// while leeching. Bytes in the last round.
    pub rank_rate: u64,
    /// Payload we sent this peer in the last round (rate-based choker).
    pub uploaded_in_round: u64,
    /// Bittyrant estimate of the peer's reciprocation rate.
    pub est_reciprocation_rate: u64,
}

/// Decisions for the regular (non-optimistic) choke pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UnchokeDecisions {
    pub unchoke: Vec<ConnId>,
    pub choke: Vec<ConnId>,
    /// Peers whose optimistic flag must be cleared (promoted into the
    /// regular set, or no longer unchokable).
    pub clear_optimistic: Vec<ConnId>,
    /// Slot count after any rate-based adjustment, for I4 accounting.
    pub allowed_upload_slots: usize,
}

/// Runs the configured choker over the candidates.
///
/// `unchoke_interval_ms` converts round byte counts into rates for the
/// rate-based slot estimate.
pub fn recalculate_unchoke_slots(
    candidates: &[UnchokeCandidate],
    settings: &SessionSettings,
    upload_rate_limit: u64,
    unchoke_interval_ms: u64,
) -> UnchokeDecisions {
    let mut decisions = UnchokeDecisions::default();

    // split off peers that cannot hold a slot right now
    let mut pool: Vec<&UnchokeCandidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if candidate.ignore_unchoke_slots || candidate.torrent_paused {
            continue;
        }
        if !candidate.interested || candidate.disconnecting || candidate.connecting {
            if !candidate.choked {
                decisions.choke.push(candidate.conn);
                if candidate.optimistically_unchoked {
                    decisions.clear_optimistic.push(candidate.conn);
                }
            }
            continue;
        }
        pool.push(candidate);
    }

    let mut allowed_slots = settings.unchoke_slots;

    if settings.choker == ChokerMode::RateBased {
        // slots grow with the observed upload rates in 1 KiB/s steps:
        // the fastest peer must beat 1 KiB/s, the next 2 KiB/s, and so
        // on. One extra slot is reserved for the optimistic unchoke.
        let mut rates: Vec<u64> = pool
            .iter()
            .map(|c| c.uploaded_in_round * 1000 / unchoke_interval_ms.max(1))
            .collect();
        rates.sort_unstable_by(|a, b| b.cmp(a));
        let mut slots = 0usize;
        let mut threshold = RATE_CHOKER_STEP;
        for rate in rates {
            if rate < threshold {
                break;
            }
            slots += 1;
            threshold += RATE_CHOKER_STEP;
        }
        allowed_slots = slots + 1;
    }

    match settings.choker {
        ChokerMode::Bittyrant => {
            // rank by reciprocation per upload cost; fill a capacity
            // budget instead of a slot count
            pool.sort_by(|a, b| {
                let a_ratio = ratio(a.rank_rate, a.est_reciprocation_rate);
                let b_ratio = ratio(b.rank_rate, b.est_reciprocation_rate);
                b_ratio.cmp(&a_ratio)
            });
            let mut budget = if upload_rate_limit > 0 {
                upload_rate_limit
            } else {
                BITTYRANT_DEFAULT_CAPACITY + BITTYRANT_PEAK_HEADROOM
            };
            for candidate in &pool {
                let cost = candidate.est_reciprocation_rate.max(1);
                if cost <= budget {
                    budget -= cost;
                    decisions.unchoke.push(candidate.conn);
                    if candidate.optimistically_unchoked {
                        decisions.clear_optimistic.push(candidate.conn);
                    }
                } else if !candidate.choked && !candidate.optimistically_unchoked {
                    decisions.choke.push(candidate.conn);
                }
            }
        }
        ChokerMode::FixedSlots | ChokerMode::RateBased => {
            pool.sort_by(|a, b| b.rank_rate.cmp(&a.rank_rate));
            let reserved = settings.effective_optimistic_slots();
            let set_size = allowed_slots.saturating_sub(reserved);
            for (i, candidate) in pool.iter().enumerate() {
                if i < set_size {
                    decisions.unchoke.push(candidate.conn);
                    if candidate.optimistically_unchoked {
                        // promoted into the proper set; a fresh
                        // optimistic unchoke will be picked
                        decisions.clear_optimistic.push(candidate.conn);
                    }
                } else if !candidate.choked && !candidate.optimistically_unchoked {
                    decisions.choke.push(candidate.conn);
                }
            }
        }
    }

    decisions.allowed_upload_slots = allowed_slots;
    decisions
}

/// Decisions for the optimistic rotation pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OptimisticDecisions {
    /// Grant the optimistic slot (unchoke, stamp the grant time).
    pub grant: Vec<ConnId>,
    /// Revoke it (choke, clear the flag).
    pub revoke: Vec<ConnId>,
}

/// Rotates the optimistic slots among interested, currently-choked
/// candidates plus the current holders.
pub fn recalculate_optimistic_unchoke_slots(
    candidates: &[UnchokeCandidate],
    settings: &SessionSettings,
) -> OptimisticDecisions {
    let mut decisions = OptimisticDecisions::default();
    if settings.unchoke_slots == 0 {
        return decisions;
    }

    let mut eligible: Vec<&UnchokeCandidate> = candidates
        .iter()
        .filter(|c| {
            !c.ignore_unchoke_slots
                && !c.torrent_paused
                && !c.connecting
                && !c.disconnecting
                && (c.optimistically_unchoked || (c.interested && c.choked))
        })
        .collect();

    // shuffle first so equal grant times do not favor iteration order
    eligible.shuffle(&mut rand::rng());
    eligible.sort_by_key(|c| c.last_optimistic_unchoke);

    let num_slots = settings.effective_optimistic_slots();
    for (i, candidate) in eligible.iter().enumerate() {
        if i < num_slots {
            if !candidate.optimistically_unchoked {
                decisions.grant.push(candidate.conn);
            }
        } else if candidate.optimistically_unchoked {
            decisions.revoke.push(candidate.conn);
        }
    }
    decisions
}

fn ratio(download: u64, upload: u64) -> u64 {
    download * 1000 / upload.max(1)
}
