//! Tracker tier state for one torrent.
//!
//! Trackers are arranged in tiers; announces walk tiers in order and try
//! each tracker within a tier until one answers. A responding tracker is
//! promoted to the front of its tier. Failures back off exponentially per
//! tracker, and the interval the tracker hands back (including
//! `min interval`) is honored.

use std::time::{Duration, Instant};

use crate::constants::{
    TRACKER_BACKOFF_BASE, TRACKER_BACKOFF_MAX_EXP, TRACKER_DEFAULT_INTERVAL,
};

/// One announce URL and its schedule state.
#[derive(Debug, Clone)]
pub struct TrackerEntry {
    pub url: String,
    pub tier: u8,
    /// Consecutive failed announces.
    pub fails: u32,
    /// Do not announce again before this.
    pub next_announce: Option<Instant>,
    /// Interval the tracker asked for on its last response.
    pub interval: Duration,
    /// `min interval` from the tracker, a hard floor we honor.
    pub min_interval: Option<Duration>,
    /// Whether we have announced `started` to this tracker.
    pub started: bool,
}

impl TrackerEntry {
    fn new(url: String, tier: u8) -> Self {
        Self {
            url,
            tier,
            fails: 0,
            next_announce: None,
            interval: TRACKER_DEFAULT_INTERVAL,
            min_interval: None,
            started: false,
        }
    }

    fn due(&self, now: Instant) -> bool {
        match self.next_announce {
            Some(at) => now >= at,
            None => true,
        }
    }
}

/// The torrent's tracker list, ordered by (tier, position).
#[derive(Debug, Default)]
pub struct TrackerTiers {
    entries: Vec<TrackerEntry>,
}

impl TrackerTiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_urls<I: IntoIterator<Item = (String, u8)>>(urls: I) -> Self {
        let mut tiers = Self::new();
        for (url, tier) in urls {
            tiers.add(url, tier);
        }
        tiers
    }

    pub fn add(&mut self, url: String, tier: u8) {
        if self.entries.iter().any(|e| e.url == url) {
            return;
        }
        self.entries.push(TrackerEntry::new(url, tier));
        self.entries.sort_by_key(|e| e.tier);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TrackerEntry] {
        &self.entries
    }

    /// The next tracker due for an announce: lowest tier first, within a
    /// tier the front-most due entry.
    pub fn next_due(&self, now: Instant) -> Option<&TrackerEntry> {
        self.entries.iter().find(|e| e.due(now))
    }

    /// Records a successful announce: reset the failure counter, honor
    /// the returned interval (clamped up to `min interval`), and promote
    /// the tracker to the front of its tier.
    pub fn on_announce_ok(
        &mut self,
        url: &str,
        interval: Duration,
        min_interval: Option<Duration>,
        now: Instant,
    ) {
        let Some(pos) = self.entries.iter().position(|e| e.url == url) else {
            return;
        };
        {
            let entry = &mut self.entries[pos];
            entry.fails = 0;
            entry.started = true;
            entry.interval = interval.max(Duration::from_secs(1));
            entry.min_interval = min_interval;
            let wait = min_interval.map_or(interval, |min| interval.max(min));
            entry.next_announce = Some(now + wait);
        }
        // promote within the tier
        let tier = self.entries[pos].tier;
        let first_in_tier = self
            .entries
            .iter()
            .position(|e| e.tier == tier)
            .expect("tier has at least this entry");
        if first_in_tier < pos {
            let entry = self.entries.remove(pos);
            self.entries.insert(first_in_tier, entry);
        }
    }

    /// Records a failed announce with exponential back-off.
    pub fn on_announce_failed(&mut self, url: &str, now: Instant) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.url == url) {
            entry.fails += 1;
            let exp = entry.fails.min(TRACKER_BACKOFF_MAX_EXP);
            let backoff = TRACKER_BACKOFF_BASE * 2u32.pow(exp.saturating_sub(1));
            let floor = entry.min_interval.unwrap_or(Duration::ZERO);
            entry.next_announce = Some(now + backoff.max(floor));
        }
    }

    /// Trackers we have announced `started` to; these get `stopped` when
    /// the torrent is removed.
    pub fn started_urls(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.started)
            .map(|e| e.url.clone())
            .collect()
    }
}
