//! The auto-manage scheduler.
//!
//! Every `auto_manage_interval` the engine snapshots its torrents and
//! recomputes which auto-managed ones may be active. Torrents are
//! partitioned into checking, downloaders and seeds; each group is
//! sorted (queue position ascending, seeds by seed rank descending) and
//! granted activity up to the per-category and hard limits. Announce
//! permissions (DHT, tracker, LSD) walk down their own limits across
//! all torrents in order.
//!
//! A torrent that has produced no payload since it started is treated
//! as *inactive* once its startup grace expires: it keeps running but
//! only consumes the hard limit, not its category's slot.

use crate::meta::InfoHash;
use crate::session::settings::SessionSettings;
use crate::torrent::Activity;

/// Snapshot of one torrent for the scheduler.
#[derive(Debug, Clone)]
pub struct AutoManageEntry {
    pub hash: InfoHash,
    pub auto_managed: bool,
    pub paused: bool,
    pub checking: bool,
    pub finished: bool,
    pub has_error: bool,
    pub queue_pos: i64,
    pub seed_rank: i64,
    pub activity: Activity,
}

/// What to apply after a recomputation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AutoManageDecisions {
    /// Torrents to resume (granted a slot). Interrupted checks restart.
    pub resume: Vec<InfoHash>,
    /// Torrents to pause gracefully (lost their slot).
    pub pause: Vec<InfoHash>,
    /// Per-torrent announce permissions: (hash, dht, tracker, lsd).
    pub announce: Vec<(InfoHash, bool, bool, bool)>,
}

fn limit(value: i32) -> i64 {
    if value < 0 {
        i64::MAX
    } else {
        value as i64
    }
}

struct Budget {
    checking: i64,
    hard: i64,
    dht: i64,
    tracker: i64,
    lsd: i64,
}

pub fn recalculate_auto_managed_torrents(
    entries: &[AutoManageEntry],
    settings: &SessionSettings,
) -> AutoManageDecisions {
    let mut decisions = AutoManageDecisions::default();

    let mut num_downloaders = limit(settings.active_downloads);
    let mut num_seeds = limit(settings.active_seeds);
    let mut budget = Budget {
        checking: 1,
        hard: limit(settings.active_limit),
        dht: limit(settings.active_dht_limit),
        tracker: limit(settings.active_tracker_limit),
        lsd: limit(settings.active_lsd_limit),
    };

    let mut checking = Vec::new();
    let mut downloaders = Vec::new();
    let mut seeds = Vec::new();

    for entry in entries {
        if entry.auto_managed && !entry.has_error {
            if entry.checking {
                checking.push(entry);
            } else if entry.finished {
                seeds.push(entry);
            } else {
                downloaders.push(entry);
            }
        } else if !entry.paused {
            // manually started torrents consume the global budgets
            if entry.checking {
                budget.checking -= 1;
            } else {
                budget.hard -= 1;
            }
        }
    }

    checking.sort_by_key(|e| e.queue_pos);
    downloaders.sort_by_key(|e| e.queue_pos);
    seeds.sort_by_key(|e| std::cmp::Reverse(e.seed_rank));

    let mut no_type_limit = i64::MAX;
    grant(&checking, &mut no_type_limit, &mut budget, &mut decisions);
    if settings.auto_manage_prefer_seeds {
        grant(&seeds, &mut num_seeds, &mut budget, &mut decisions);
        grant(&downloaders, &mut num_downloaders, &mut budget, &mut decisions);
    } else {
        grant(&downloaders, &mut num_downloaders, &mut budget, &mut decisions);
        grant(&seeds, &mut num_seeds, &mut budget, &mut decisions);
    }

    decisions
}

fn grant(
    list: &[&AutoManageEntry],
    type_limit: &mut i64,
    budget: &mut Budget,
    decisions: &mut AutoManageDecisions,
) {
    for entry in list {
        if entry.checking {
            if budget.checking > 0 {
                budget.checking -= 1;
                decisions.resume.push(entry.hash);
            } else {
                decisions.pause.push(entry.hash);
            }
            continue;
        }

        budget.dht -= 1;
        budget.tracker -= 1;
        budget.lsd -= 1;
        decisions.announce.push((
            entry.hash,
            budget.dht >= 0,
            budget.tracker >= 0,
            budget.lsd >= 0,
        ));

        // a running torrent that never produced payload only holds a
        // hard slot; its category slot goes to the next in line
        if !entry.paused && entry.activity == Activity::Inactive && budget.hard > 0 {
            budget.hard -= 1;
            continue;
        }

        if *type_limit > 0 && budget.hard > 0 {
            budget.hard -= 1;
            *type_limit -= 1;
            decisions.resume.push(entry.hash);
        } else {
            decisions.pause.push(entry.hash);
        }
    }
}
