//! The piece picker.
//!
//! Tracks availability across the swarm, partial-piece block states, and
//! which connection requested what. Selection is rarest-first with a
//! random tie-break, preferring to finish partial pieces before opening
//! new ones. When every missing block is already requested somewhere the
//! picker enters end-game and hands out duplicates; the first completion
//! wins and the rest get cancelled.
//!
//! A given (piece, block) is accepted at most once. Duplicate deliveries
//! report [`BlockOutcome::Duplicate`] and are discarded.

use std::collections::HashMap;

use bytes::Bytes;
use rand::seq::SliceRandom;

use crate::constants::{BLOCK_SIZE, ENDGAME_BLOCK_THRESHOLD};
use crate::meta::TorrentMeta;
use crate::peer::{Bitfield, ConnId};

/// One transport block within a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRef {
    fn block_index(&self) -> usize {
        (self.offset / BLOCK_SIZE) as usize
    }
}

/// Result of delivering a block to the picker.
#[derive(Debug)]
pub enum BlockOutcome {
    /// First delivery; if the piece is now fully buffered, its assembled
    /// bytes are returned for hashing.
    Accepted {
        piece_complete: Option<Bytes>,
        /// Other connections that still have this block in flight
        /// (end-game duplicates to cancel).
        duplicates: Vec<ConnId>,
    },
    /// The block was already delivered or the piece is done; discard.
    Duplicate,
    /// The block does not match the torrent geometry.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Missing,
    Requested,
    Finished,
}

struct PartialPiece {
    states: Vec<BlockState>,
    data: Vec<Option<Bytes>>,
    /// Which connections have each block in flight.
    holders: HashMap<usize, Vec<ConnId>>,
}

impl PartialPiece {
    fn new(num_blocks: usize) -> Self {
        Self {
            states: vec![BlockState::Missing; num_blocks],
            data: vec![None; num_blocks],
            holders: HashMap::new(),
        }
    }

    fn finished_blocks(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s == BlockState::Finished)
            .count()
    }
}

pub struct PiecePicker {
    piece_lengths: Vec<u32>,
    /// How many connected peers have each piece.
    availability: Vec<u32>,
    have: Bitfield,
    /// 0 skips the piece; higher downloads sooner. Default 4.
    priorities: Vec<u8>,
    partials: HashMap<u32, PartialPiece>,
    endgame: bool,
}

impl PiecePicker {
    pub fn new(meta: &TorrentMeta) -> Self {
        let num_pieces = meta.num_pieces();
        Self {
            piece_lengths: (0..num_pieces).map(|i| meta.piece_len(i)).collect(),
            availability: vec![0; num_pieces as usize],
            have: Bitfield::new(num_pieces as usize),
            priorities: vec![4; num_pieces as usize],
            partials: HashMap::new(),
            endgame: false,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_lengths.len()
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn num_have(&self) -> usize {
        self.have.count()
    }

    pub fn is_finished(&self) -> bool {
        (0..self.num_pieces())
            .all(|i| self.have.has(i) || self.priorities[i] == 0)
    }

    pub fn in_endgame(&self) -> bool {
        self.endgame
    }

    pub fn set_priority(&mut self, piece: u32, priority: u8) {
        if let Some(p) = self.priorities.get_mut(piece as usize) {
            *p = priority.min(7);
        }
    }

    /// Marks a piece as verified-on-disk, for resume data.
    pub fn set_have(&mut self, piece: u32) {
        self.partials.remove(&piece);
        self.have.set(piece as usize);
    }

    // ------------------------------------------------------------------
    // availability
    // ------------------------------------------------------------------

    pub fn peer_joined(&mut self, peer_has: &Bitfield) {
        for piece in peer_has.iter_set() {
            if let Some(count) = self.availability.get_mut(piece) {
                *count += 1;
            }
        }
    }

    pub fn peer_left(&mut self, peer_has: &Bitfield) {
        for piece in peer_has.iter_set() {
            if let Some(count) = self.availability.get_mut(piece) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn peer_has_piece(&mut self, piece: u32) {
        if let Some(count) = self.availability.get_mut(piece as usize) {
            *count += 1;
        }
    }

    pub fn availability(&self, piece: u32) -> u32 {
        self.availability.get(piece as usize).copied().unwrap_or(0)
    }

    /// True if the peer has any piece we still want.
    pub fn is_interesting(&self, peer_has: &Bitfield) -> bool {
        (0..self.num_pieces()).any(|i| {
            peer_has.has(i) && !self.have.has(i) && self.priorities[i] > 0
        })
    }

    // ------------------------------------------------------------------
    // selection
    // ------------------------------------------------------------------

    /// Picks up to `want` blocks the peer can supply.
    ///
    /// Partial pieces are drained before new pieces are opened; new
    /// pieces are chosen rarest-first with priority as the leading key
    /// and a shuffled tie-break. Duplicates are only handed out in
    /// end-game, and never to a connection that already holds the block.
    pub fn pick(&mut self, peer_has: &Bitfield, want: usize, conn: ConnId) -> Vec<BlockRef> {
        let mut picked = Vec::new();
        if want == 0 {
            return picked;
        }

        // pass 1: missing blocks of already-open pieces
        let mut open: Vec<u32> = self.partials.keys().copied().collect();
        open.sort_unstable();
        for piece in open {
            if picked.len() >= want {
                break;
            }
            if peer_has.has(piece as usize) {
                self.pick_from_piece(piece, peer_has, want, conn, &mut picked, false);
            }
        }

        // pass 2: open new pieces, rarest first
        if picked.len() < want {
            let mut candidates: Vec<u32> = (0..self.num_pieces() as u32)
                .filter(|&i| {
                    peer_has.has(i as usize)
                        && !self.have.has(i as usize)
                        && self.priorities[i as usize] > 0
                        && !self.partials.contains_key(&i)
                })
                .collect();
            candidates.shuffle(&mut rand::rng());
            candidates.sort_by_key(|&i| {
                (
                    std::cmp::Reverse(self.priorities[i as usize]),
                    self.availability[i as usize],
                )
            });
            for piece in candidates {
                if picked.len() >= want {
                    break;
                }
                self.open_piece(piece);
                self.pick_from_piece(piece, peer_has, want, conn, &mut picked, false);
            }
        }

        // pass 3: end-game duplicates
        if picked.len() < want {
            self.maybe_enter_endgame();
            if self.endgame {
                let mut open: Vec<u32> = self.partials.keys().copied().collect();
                open.sort_unstable();
                for piece in open {
                    if picked.len() >= want {
                        break;
                    }
                    if peer_has.has(piece as usize) {
                        self.pick_from_piece(piece, peer_has, want, conn, &mut picked, true);
                    }
                }
            }
        }

        picked
    }

    fn open_piece(&mut self, piece: u32) {
        let num_blocks = self.piece_lengths[piece as usize].div_ceil(BLOCK_SIZE) as usize;
        self.partials
            .entry(piece)
            .or_insert_with(|| PartialPiece::new(num_blocks));
    }

    fn pick_from_piece(
        &mut self,
        piece: u32,
        _peer_has: &Bitfield,
        want: usize,
        conn: ConnId,
        picked: &mut Vec<BlockRef>,
        duplicates: bool,
    ) {
        let piece_len = self.piece_lengths[piece as usize];
        let Some(partial) = self.partials.get_mut(&piece) else {
            return;
        };
        for (idx, state) in partial.states.iter_mut().enumerate() {
            if picked.len() >= want {
                return;
            }
            let eligible = match state {
                BlockState::Missing => true,
                BlockState::Requested if duplicates => {
                    // never duplicate to a holder of the same block
                    !partial
                        .holders
                        .get(&idx)
                        .is_some_and(|holders| holders.contains(&conn))
                }
                _ => false,
            };
            if !eligible {
                continue;
            }
            *state = BlockState::Requested;
            partial.holders.entry(idx).or_default().push(conn);
            let offset = idx as u32 * BLOCK_SIZE;
            picked.push(BlockRef {
                piece,
                offset,
                length: (piece_len - offset).min(BLOCK_SIZE),
            });
        }
    }

    fn maybe_enter_endgame(&mut self) {
        if self.endgame {
            return;
        }
        // count blocks not yet requested anywhere across wanted pieces
        let mut unrequested = 0usize;
        for piece in 0..self.num_pieces() as u32 {
            if self.have.has(piece as usize) || self.priorities[piece as usize] == 0 {
                continue;
            }
            match self.partials.get(&piece) {
                Some(partial) => {
                    unrequested += partial
                        .states
                        .iter()
                        .filter(|s| **s == BlockState::Missing)
                        .count();
                }
                None => {
                    unrequested +=
                        self.piece_lengths[piece as usize].div_ceil(BLOCK_SIZE) as usize;
                }
            }
            if unrequested > ENDGAME_BLOCK_THRESHOLD {
                return;
            }
        }
        self.endgame = true;
    }

    // ------------------------------------------------------------------
    // request bookkeeping
    // ------------------------------------------------------------------

    /// A request was lost (choke, timeout, disconnect); make the block
    /// pickable again unless another connection still has it in flight.
    pub fn request_lost(&mut self, block: BlockRef, conn: ConnId) {
        if let Some(partial) = self.partials.get_mut(&block.piece) {
            let idx = block.block_index();
            if let Some(holders) = partial.holders.get_mut(&idx) {
                holders.retain(|c| *c != conn);
                if holders.is_empty() {
                    partial.holders.remove(&idx);
                    if partial.states.get(idx) == Some(&BlockState::Requested) {
                        partial.states[idx] = BlockState::Missing;
                    }
                }
            }
        }
    }

    /// All in-flight requests held by a departing connection.
    pub fn connection_lost(&mut self, conn: ConnId) {
        let pieces: Vec<u32> = self.partials.keys().copied().collect();
        for piece in pieces {
            let partial = self.partials.get_mut(&piece).expect("key just listed");
            let indices: Vec<usize> = partial.holders.keys().copied().collect();
            for idx in indices {
                let holders = partial.holders.get_mut(&idx).expect("key just listed");
                holders.retain(|c| *c != conn);
                if holders.is_empty() {
                    partial.holders.remove(&idx);
                    if partial.states.get(idx) == Some(&BlockState::Requested) {
                        partial.states[idx] = BlockState::Missing;
                    }
                }
            }
        }
    }

    /// Delivers a block. At most one delivery per block is accepted.
    pub fn on_block(&mut self, block: BlockRef, data: Bytes, conn: ConnId) -> BlockOutcome {
        if block.piece as usize >= self.num_pieces() || self.have.has(block.piece as usize) {
            return BlockOutcome::Duplicate;
        }
        let piece_len = self.piece_lengths[block.piece as usize];
        if block.offset % BLOCK_SIZE != 0
            || block.offset + block.length > piece_len
            || block.length != (piece_len - block.offset).min(BLOCK_SIZE)
        {
            return BlockOutcome::Unknown;
        }

        self.open_piece(block.piece);
        let partial = self.partials.get_mut(&block.piece).expect("just opened");
        let idx = block.block_index();

        if partial.states[idx] == BlockState::Finished {
            return BlockOutcome::Duplicate;
        }
        partial.states[idx] = BlockState::Finished;
        partial.data[idx] = Some(data);
        let duplicates = partial
            .holders
            .remove(&idx)
            .unwrap_or_default()
            .into_iter()
            .filter(|c| *c != conn)
            .collect();

        let piece_complete = if partial.finished_blocks() == partial.states.len() {
            let mut assembled = Vec::with_capacity(piece_len as usize);
            for chunk in partial.data.iter().flatten() {
                assembled.extend_from_slice(chunk);
            }
            Some(Bytes::from(assembled))
        } else {
            None
        };

        BlockOutcome::Accepted {
            piece_complete,
            duplicates,
        }
    }

    /// The assembled piece passed its hash check.
    pub fn on_piece_verified(&mut self, piece: u32) {
        self.partials.remove(&piece);
        self.have.set(piece as usize);
    }

    /// The assembled piece failed its hash check; forget its blocks so
    /// they are picked again.
    pub fn on_piece_failed(&mut self, piece: u32) {
        self.partials.remove(&piece);
    }

    /// Forgets all transient state but keeps verified pieces; used when
    /// a torrent is paused for a long time.
    pub fn clear_partials(&mut self) {
        self.partials.clear();
        self.endgame = false;
    }
}
