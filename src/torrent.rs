//! Torrents: one per info hash, owner of the peer set and piece picker.
//!
//! A torrent exclusively owns its peer connections; the session keeps a
//! weak view (connection id to info hash) for global iteration. All
//! mutation happens on the engine task.

pub mod picker;
pub mod resume;
pub mod trackers;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::meta::{InfoHash, TorrentMeta};
use crate::peer::{Bitfield, ConnId, Message, PeerConnection};
use crate::session::lists::ListPositions;
use picker::{BlockOutcome, BlockRef, PiecePicker};
use trackers::TrackerTiers;

/// Torrent lifecycle state, as reported in status updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    /// Verifying pieces already on disk.
    CheckingFiles,
    /// Waiting for metadata from the swarm (magnet add).
    DownloadingMetadata,
    Downloading,
    /// All wanted pieces present; seeding.
    Seeding,
    /// A disk or torrent-level failure; inert until cleared.
    Error,
}

/// Result of feeding a received block through the torrent.
#[derive(Debug)]
pub enum BlockResult {
    /// Accepted; nothing else happened.
    Progress,
    /// Accepted and it completed a piece that passed its hash.
    PieceComplete {
        piece: u32,
        data: Bytes,
        /// Connections holding duplicate in-flight requests to cancel.
        duplicates: Vec<ConnId>,
        torrent_finished: bool,
    },
    /// Completed a piece that failed its hash; availability of trust
    /// adjustments are the caller's job.
    HashFailed { piece: u32 },
    /// Discarded (duplicate or unknown).
    Ignored,
}

pub struct Torrent {
    pub info_hash: InfoHash,
    /// Present while loaded; dropped by `unload`.
    pub meta: Option<TorrentMeta>,
    pub picker: Option<PiecePicker>,
    /// The peers this torrent owns.
    pub peers: HashMap<ConnId, PeerConnection>,
    pub trackers: TrackerTiers,

    /// Position in the download queue; -1 means not queued.
    pub queue_pos: i64,
    pub auto_managed: bool,
    pub paused: bool,
    /// Graceful pause: no new requests, existing peers stay connected.
    pub graceful_pause: bool,
    /// Auto-manage output: whether new peer connections are allowed.
    pub allow_peers: bool,
    pub announce_to_dht: bool,
    pub announce_to_trackers: bool,
    pub announce_to_lsd: bool,
    /// Pinned torrents are never evicted from the loaded LRU.
    pub pinned: bool,
    pub state: TorrentState,
    pub error: Option<String>,

    /// Candidate peers learned from trackers, DHT, LSD, resume data.
    pub candidates: VecDeque<SocketAddr>,
    known_candidates: HashSet<SocketAddr>,
    pub max_connections: usize,

    /// Session-list membership slots, maintained by the session.
    pub list_pos: ListPositions,

    /// Session time (seconds) when the torrent was last started.
    pub started_at: u64,
    /// Payload transferred since `started_at`, for the auto-manage
    /// inactivity test.
    pub payload_since_start: u64,
    /// Session time when seeding began, for seed ranking.
    pub seeding_since: Option<u64>,
    /// Swarm seed count from the last scrape.
    pub scraped_complete: Option<u32>,
    /// Swarm leecher count from the last scrape.
    pub scraped_incomplete: Option<u32>,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
    /// Set when a status update should be emitted for this torrent.
    pub state_dirty: bool,
}

impl Torrent {
    pub fn new(info_hash: InfoHash, meta: Option<TorrentMeta>, max_connections: usize) -> Self {
        let picker = meta.as_ref().map(PiecePicker::new);
        let state = if meta.is_some() {
            TorrentState::Downloading
        } else {
            TorrentState::DownloadingMetadata
        };
        Self {
            info_hash,
            meta,
            picker,
            peers: HashMap::new(),
            trackers: TrackerTiers::new(),
            queue_pos: -1,
            auto_managed: true,
            paused: false,
            graceful_pause: false,
            allow_peers: true,
            announce_to_dht: true,
            announce_to_trackers: true,
            announce_to_lsd: true,
            pinned: false,
            state,
            error: None,
            candidates: VecDeque::new(),
            known_candidates: HashSet::new(),
            max_connections,
            list_pos: ListPositions::default(),
            started_at: 0,
            payload_since_start: 0,
            seeding_since: None,
            scraped_complete: None,
            scraped_incomplete: None,
            total_downloaded: 0,
            total_uploaded: 0,
            state_dirty: true,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.meta.is_some()
    }

    pub fn has_error(&self) -> bool {
        self.state == TorrentState::Error
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, TorrentState::Seeding)
    }

    pub fn is_checking(&self) -> bool {
        self.state == TorrentState::CheckingFiles
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    /// Sets a torrent-level error and freezes activity.
    pub fn set_error(&mut self, message: String) {
        self.error = Some(message);
        self.state = TorrentState::Error;
        self.state_dirty = true;
    }

    // ------------------------------------------------------------------
    // membership predicates for the session lists
    // ------------------------------------------------------------------

    /// The torrent needs per-tick servicing.
    pub fn want_tick(&self) -> bool {
        !self.paused && !self.has_error() && (!self.peers.is_empty() || !self.candidates.is_empty())
    }

    /// Accepts and needs peers for downloading.
    pub fn want_peers_download(&self) -> bool {
        self.allow_peers
            && !self.paused
            && !self.has_error()
            && !self.is_finished()
            && self.is_loaded()
            && self.peers.len() < self.max_connections
            && !self.candidates.is_empty()
    }

    /// Accepts and needs peers while seeding.
    pub fn want_peers_finished(&self) -> bool {
        self.allow_peers
            && !self.paused
            && !self.has_error()
            && self.is_finished()
            && self.peers.len() < self.max_connections
            && !self.candidates.is_empty()
    }

    pub fn want_scrape(&self) -> bool {
        self.paused && self.auto_managed && !self.has_error()
    }

    // ------------------------------------------------------------------
    // peer candidates
    // ------------------------------------------------------------------

    /// Adds discovered peers, dropping duplicates.
    pub fn add_candidates<I: IntoIterator<Item = SocketAddr>>(&mut self, addrs: I) {
        for addr in addrs {
            if self.known_candidates.insert(addr) {
                self.candidates.push_back(addr);
            }
        }
    }

    /// Pops the next address to dial.
    pub fn next_candidate(&mut self) -> Option<SocketAddr> {
        self.candidates.pop_front()
    }

    /// Makes an address eligible again after its connection closed.
    pub fn recycle_candidate(&mut self, addr: SocketAddr) {
        self.known_candidates.remove(&addr);
    }

    // ------------------------------------------------------------------
    // lifecycle operations
    // ------------------------------------------------------------------

    /// Pauses the torrent. A graceful pause cancels outstanding block
    /// requests and stops issuing new ones but leaves peers connected.
    pub fn pause(&mut self, graceful: bool, now: Instant) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.graceful_pause = graceful;
        self.state_dirty = true;
        debug!(torrent = %self.info_hash, graceful, "pausing");

        // cancel outbound requests and release their picker claims
        let mut lost: Vec<(ConnId, Vec<BlockRef>)> = Vec::new();
        for (id, peer) in &mut self.peers {
            let blocks: Vec<BlockRef> = peer.requests.iter().map(|r| r.block).collect();
            for block in &blocks {
                peer.cancel_request(*block, now);
            }
            if !blocks.is_empty() {
                lost.push((*id, blocks));
            }
        }
        if let Some(picker) = &mut self.picker {
            for (conn, blocks) in lost {
                for block in blocks {
                    picker.request_lost(block, conn);
                }
            }
        }
    }

    pub fn resume(&mut self, session_time: u64) {
        if !self.paused {
            return;
        }
        self.paused = false;
        self.graceful_pause = false;
        self.started_at = session_time;
        self.payload_since_start = 0;
        self.state_dirty = true;
    }

    /// Releases metadata and picker state while keeping persistent
    /// identifiers; the LRU calls this when evicting.
    pub fn unload(&mut self) {
        debug!(torrent = %self.info_hash, "unloading");
        self.meta = None;
        self.picker = None;
        if self.state != TorrentState::Error {
            self.state = TorrentState::DownloadingMetadata;
        }
    }

    /// Reloads metadata after an eviction, rebuilding the picker from
    /// the verified-piece bitfield.
    pub fn load(&mut self, meta: TorrentMeta, have: Option<&Bitfield>) {
        let mut picker = PiecePicker::new(&meta);
        if let Some(have) = have {
            for piece in have.iter_set() {
                picker.set_have(piece as u32);
            }
        }
        self.state = if picker.is_finished() {
            TorrentState::Seeding
        } else {
            TorrentState::Downloading
        };
        self.meta = Some(meta);
        self.picker = Some(picker);
        self.state_dirty = true;
    }

    /// Metadata arrived (magnet flow); same as load but announces the
    /// transition.
    pub fn set_metadata(&mut self, meta: TorrentMeta) {
        info!(torrent = %self.info_hash, name = %meta.name, "metadata complete");
        self.load(meta, None);
    }

    // ------------------------------------------------------------------
    // block flow
    // ------------------------------------------------------------------

    /// Feeds a received block through the picker and, on piece
    /// completion, verifies the hash.
    pub fn on_block(&mut self, block: BlockRef, data: Bytes, from: ConnId) -> BlockResult {
        let Some(meta) = &self.meta else {
            return BlockResult::Ignored;
        };
        let Some(picker) = &mut self.picker else {
            return BlockResult::Ignored;
        };

        self.total_downloaded += data.len() as u64;
        self.payload_since_start += data.len() as u64;

        match picker.on_block(block, data, from) {
            BlockOutcome::Accepted {
                piece_complete: None,
                duplicates,
            } => {
                debug_assert!(duplicates.is_empty() || picker.in_endgame());
                BlockResult::Progress
            }
            BlockOutcome::Accepted {
                piece_complete: Some(assembled),
                duplicates,
            } => {
                let piece = block.piece;
                let mut hasher = Sha1::new();
                hasher.update(&assembled);
                let digest: [u8; 20] = hasher.finalize().into();

                if digest == meta.piece_hashes[piece as usize] {
                    picker.on_piece_verified(piece);
                    let finished = picker.is_finished();
                    if finished {
                        self.state = TorrentState::Seeding;
                        self.state_dirty = true;
                    }
                    BlockResult::PieceComplete {
                        piece,
                        data: assembled,
                        duplicates,
                        torrent_finished: finished,
                    }
                } else {
                    picker.on_piece_failed(piece);
                    BlockResult::HashFailed { piece }
                }
            }
            BlockOutcome::Duplicate => BlockResult::Ignored,
            BlockOutcome::Unknown => BlockResult::Ignored,
        }
    }

    /// Broadcasts `have` to every active peer after a verified piece.
    pub fn broadcast_have(&mut self, piece: u32, now: Instant) {
        for peer in self.peers.values_mut() {
            if peer.is_active() {
                peer.send(&Message::Have { piece }, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // ranking
    // ------------------------------------------------------------------

    /// Seed rank for the auto-manager: higher keeps seeding longer.
    /// Fresh, under-shared seeds in swarms that still have leechers
    /// outrank long-served ones.
    pub fn seed_rank(&self, session_time: u64) -> i64 {
        let seed_time = self
            .seeding_since
            .map(|since| session_time.saturating_sub(since))
            .unwrap_or(0) as i64;
        let ratio = if self.total_downloaded == 0 {
            0
        } else {
            (self.total_uploaded as i64 * 1000) / self.total_downloaded as i64
        };
        // scrape-informed demand: swarms short on seeds rank higher
        let demand = match (self.scraped_complete, self.scraped_incomplete) {
            (Some(seeds), Some(leechers)) => {
                (leechers as i64 * 10 - seeds as i64).clamp(-10_000, 10_000)
            }
            _ => 0,
        };
        demand - seed_time * 10 - ratio.min(100_000)
    }

    /// Records a scrape response.
    pub fn on_scrape(&mut self, complete: u32, incomplete: u32) {
        self.scraped_complete = Some(complete);
        self.scraped_incomplete = Some(incomplete);
    }

    /// Activity classification for the auto-manager: a torrent counts
    /// against the per-category limits only once it has produced payload;
    /// until the startup grace expires it is merely "starting".
    pub fn activity(&self, session_time: u64, startup_grace: u64) -> Activity {
        if self.payload_since_start > 0 {
            Activity::Active
        } else if session_time.saturating_sub(self.started_at) < startup_grace {
            Activity::Starting
        } else {
            Activity::Inactive
        }
    }
}

/// See [`Torrent::activity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Active,
    Starting,
    Inactive,
}
