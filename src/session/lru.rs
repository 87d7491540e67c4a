//! The loaded-torrent LRU.
//!
//! When `active_loaded_limit` is positive, only that many torrents may
//! hold parsed metadata in memory. Accessing a torrent bumps it to the
//! back; making room evicts from the front. Pinned torrents never enter
//! the list and are never evicted.

use std::collections::VecDeque;

use crate::meta::InfoHash;

#[derive(Debug, Default)]
pub struct LoadedLru {
    /// Front is next to evict, back is most recently used.
    order: VecDeque<InfoHash>,
}

impl LoadedLru {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, hash: InfoHash) -> bool {
        self.order.contains(&hash)
    }

    /// Moves `hash` to the most-recently-used end (or inserts it).
    /// Pinned torrents must not be bumped; the caller filters them.
    pub fn bump(&mut self, hash: InfoHash) {
        if let Some(pos) = self.order.iter().position(|h| *h == hash) {
            self.order.remove(pos);
        }
        self.order.push_back(hash);
    }

    /// Moves `hash` to the front, making it the next eviction victim.
    pub fn demote(&mut self, hash: InfoHash) {
        if let Some(pos) = self.order.iter().position(|h| *h == hash) {
            self.order.remove(pos);
        }
        self.order.push_front(hash);
    }

    pub fn remove(&mut self, hash: InfoHash) {
        if let Some(pos) = self.order.iter().position(|h| *h == hash) {
            self.order.remove(pos);
        }
    }

    /// Evicts from the front until at most `limit` entries remain,
    /// keeping `keep` resident regardless of its position. A limit of 0
    /// means unlimited. Returns the evicted hashes in eviction order;
    /// the caller unloads them.
    pub fn evict_down_to(&mut self, limit: usize, keep: Option<InfoHash>) -> Vec<InfoHash> {
        if limit == 0 {
            return Vec::new();
        }
        let mut evicted = Vec::new();
        let mut kept_back = None;
        while self.order.len() > limit {
            let Some(front) = self.order.pop_front() else {
                break;
            };
            if Some(front) == keep {
                // re-queue after the loop so it cannot cycle forever
                if kept_back.replace(front).is_some() {
                    break;
                }
                continue;
            }
            evicted.push(front);
        }
        if let Some(kept) = kept_back {
            self.order.push_back(kept);
            while self.order.len() > limit {
                match self.order.pop_front() {
                    Some(front) if Some(front) != keep => evicted.push(front),
                    Some(front) => {
                        self.order.push_front(front);
                        break;
                    }
                    None => break,
                }
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> InfoHash {
        InfoHash([n; 20])
    }

    #[test]
    fn eviction_is_least_recently_bumped() {
        let mut lru = LoadedLru::new();
        lru.bump(hash(1));
        lru.bump(hash(2));
        lru.bump(hash(3));

        // room for 2: the oldest (1) goes
        let evicted = lru.evict_down_to(2, None);
        assert_eq!(evicted, vec![hash(1)]);

        // touching 2 makes 3 the eviction victim
        lru.bump(hash(2));
        lru.bump(hash(1));
        let evicted = lru.evict_down_to(2, None);
        assert_eq!(evicted, vec![hash(3)]);
    }

    #[test]
    fn keep_survives_eviction() {
        let mut lru = LoadedLru::new();
        lru.bump(hash(1));
        lru.bump(hash(2));
        lru.bump(hash(3));
        let evicted = lru.evict_down_to(1, Some(hash(1)));
        assert!(!evicted.contains(&hash(1)));
        assert!(lru.contains(hash(1)));
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn zero_limit_never_evicts() {
        let mut lru = LoadedLru::new();
        lru.bump(hash(1));
        lru.bump(hash(2));
        assert!(lru.evict_down_to(0, None).is_empty());
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn demote_makes_next_victim() {
        let mut lru = LoadedLru::new();
        lru.bump(hash(1));
        lru.bump(hash(2));
        lru.demote(hash(2));
        let evicted = lru.evict_down_to(1, None);
        assert_eq!(evicted, vec![hash(2)]);
    }
}
