//! The per-peer protocol state machine.
//!
//! A `PeerConnection` holds everything the engine knows about one peer:
//! lifecycle state, the four choke/interest booleans, the negotiated
//! extension set, the outbound request pipeline and inbound upload queue,
//! statistics, and timers. It performs no I/O; the socket lives in a pump
//! task and the engine feeds decoded messages in through
//! [`PeerConnection::handle_message`].
//!
//! Every terminal error routes through [`PeerConnection::start_disconnect`],
//! after which the engine detaches the connection from its torrent and
//! parks it until the pump task exits.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use super::bitfield::Bitfield;
use super::error::{DisconnectOp, PeerError};
use super::extension::ExtensionHandshake;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::transport::PumpHandle;
use crate::classes::{ClassId, SocketKind};
use crate::constants::{
    BLOCK_SIZE, HASHFAIL_THRESHOLD, INACTIVITY_TIMEOUT, INITIAL_REQUEST_WINDOW,
    KEEPALIVE_INTERVAL, REQUEST_TIMEOUT, SEND_BUFFER_WATERMARK_MIN,
};
use crate::meta::InfoHash;
use crate::torrent::picker::BlockRef;

/// Engine-wide connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Outbound connect in flight.
    Connecting,
    /// Transport up, waiting for the remote handshake.
    Handshaking,
    /// Handshake validated; the wire protocol is running.
    Active,
    /// A terminal error fired; waiting for the pump to wind down.
    Disconnecting,
}

/// Per-peer transfer statistics and rate estimates.
#[derive(Debug, Default, Clone)]
pub struct PeerStats {
    /// Payload bytes received from this peer.
    pub downloaded: u64,
    /// Payload bytes sent to this peer.
    pub uploaded: u64,
    /// Smoothed payload receive rate, bytes/s.
    pub download_rate: u64,
    /// Smoothed payload send rate, bytes/s.
    pub upload_rate: u64,
    downloaded_at_sample: u64,
    uploaded_at_sample: u64,
    /// Counters at the start of the current choke round.
    pub downloaded_at_round: u64,
    pub uploaded_at_round: u64,
}

impl PeerStats {
    /// Per-tick rate sampling with a mild exponential smoothing.
    pub fn sample_rates(&mut self, dt: Duration) {
        let secs = dt.as_secs_f64().max(0.1);
        let down = ((self.downloaded - self.downloaded_at_sample) as f64 / secs) as u64;
        let up = ((self.uploaded - self.uploaded_at_sample) as f64 / secs) as u64;
        self.download_rate = (self.download_rate * 3 + down) / 4;
        self.upload_rate = (self.upload_rate * 3 + up) / 4;
        self.downloaded_at_sample = self.downloaded;
        self.uploaded_at_sample = self.uploaded;
    }

    /// Called by the unchoke scheduler at round boundaries.
    pub fn reset_round(&mut self) {
        self.downloaded_at_round = self.downloaded;
        self.uploaded_at_round = self.uploaded;
    }

    pub fn uploaded_in_round(&self) -> u64 {
        self.uploaded - self.uploaded_at_round
    }

    pub fn downloaded_in_round(&self) -> u64 {
        self.downloaded - self.downloaded_at_round
    }
}

/// An outbound block request awaiting its data.
#[derive(Debug, Clone, Copy)]
pub struct PendingRequest {
    pub block: BlockRef,
    pub sent_at: Instant,
}

/// What the engine should do with a message the state machine accepted.
#[derive(Debug)]
pub enum Incoming {
    /// Pure state update, nothing further.
    None,
    /// Peer gained a piece; update availability and interest.
    Have(u32),
    /// Peer announced its piece set; the engine validates the length
    /// against the torrent's piece count.
    Bitfield(Bytes),
    /// Fast-extension seed shortcut.
    HaveAll,
    /// Fast-extension empty shortcut.
    HaveNone,
    /// Peer wants data; the request passed connection-level checks.
    Request(BlockRef),
    /// Peer cancelled a queued request.
    CancelUpload(BlockRef),
    /// A requested block arrived.
    Block { block: BlockRef, data: Bytes },
    /// Peer rejected one of our requests (fast extension).
    Rejected(BlockRef),
    /// Peer choked us; these requests were dropped on its side.
    ChokedUs { lost: Vec<BlockRef> },
    /// Peer unchoked us; the pipeline may fill.
    Unchoked,
    /// Peer's interest in us changed.
    InterestChanged,
    /// Extended handshake arrived.
    ExtendedHandshake,
    /// Peer told us its DHT port.
    DhtPort(u16),
}

/// Actions the per-tick timer pass asks of the engine.
#[derive(Debug, PartialEq, Eq)]
pub enum TickAction {
    None,
    SendKeepAlive,
    /// Inactivity or handshake timeout; disconnect.
    Timeout,
}

pub struct PeerConnection {
    pub id: ConnId,
    pub addr: SocketAddr,
    pub kind: SocketKind,
    pub outgoing: bool,
    pub state: PeerState,
    /// Back pointer to the owning torrent. `None` for incoming peers
    /// that have not completed the handshake.
    pub torrent: Option<InfoHash>,
    pub peer_id: Option<PeerId>,

    // The four choke/interest booleans. Both sides start choked and
    // uninterested.
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    pub supports_extensions: bool,
    pub supports_fast: bool,
    pub supports_dht: bool,
    pub extended: Option<ExtensionHandshake>,
    pub peer_bitfield: Option<Bitfield>,

    /// Outbound requests in flight, oldest first.
    pub requests: VecDeque<PendingRequest>,
    request_window: usize,
    max_request_window: usize,
    /// Inbound requests waiting to be served, oldest first.
    pub upload_queue: VecDeque<BlockRef>,
    max_upload_queue: usize,
    requests_this_tick: usize,
    max_requests_per_tick: usize,

    pub stats: PeerStats,
    pub hashfails: u32,
    /// Set when the peer stops sending despite unanswered requests.
    pub snubbed: bool,

    // unchoke scheduler bookkeeping
    pub optimistically_unchoked: bool,
    /// Session-time seconds of the last optimistic unchoke grant.
    pub last_optimistic_unchoke: u64,
    /// Bittyrant estimate of what the peer gives back when unchoked.
    pub est_reciprocation_rate: u64,

    /// Bytes queued on the pump but not yet written.
    pub send_buffer: usize,

    pub connected_at: Instant,
    pub last_sent: Instant,
    pub last_received: Instant,

    pub classes: Vec<ClassId>,
    pub disconnect_reason: Option<(PeerError, DisconnectOp)>,
    pump: PumpHandle,
}

impl PeerConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ConnId,
        addr: SocketAddr,
        kind: SocketKind,
        outgoing: bool,
        torrent: Option<InfoHash>,
        classes: Vec<ClassId>,
        max_upload_queue: usize,
        max_requests_per_tick: usize,
        max_request_window: usize,
        pump: PumpHandle,
        now: Instant,
    ) -> Self {
        Self {
            id,
            addr,
            kind,
            outgoing,
            state: if outgoing {
                PeerState::Connecting
            } else {
                PeerState::Handshaking
            },
            torrent,
            peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            supports_extensions: false,
            supports_fast: false,
            supports_dht: false,
            extended: None,
            peer_bitfield: None,
            requests: VecDeque::new(),
            request_window: INITIAL_REQUEST_WINDOW,
            max_request_window,
            upload_queue: VecDeque::new(),
            max_upload_queue,
            requests_this_tick: 0,
            max_requests_per_tick,
            stats: PeerStats::default(),
            hashfails: 0,
            snubbed: false,
            optimistically_unchoked: false,
            last_optimistic_unchoke: 0,
            est_reciprocation_rate: 0,
            send_buffer: 0,
            connected_at: now,
            last_sent: now,
            last_received: now,
            classes,
            disconnect_reason: None,
            pump,
        }
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// The outbound transport connected; next comes the handshake.
    pub fn on_transport_connected(&mut self, now: Instant) {
        if self.state == PeerState::Connecting {
            self.state = PeerState::Handshaking;
            self.connected_at = now;
        }
    }

    /// Validates the remote handshake. The caller has already resolved
    /// `expected` from its torrent table (or found nothing).
    pub fn on_handshake(
        &mut self,
        hs: &Handshake,
        expected: Option<InfoHash>,
        now: Instant,
    ) -> Result<(), PeerError> {
        let info_hash = InfoHash(hs.info_hash);
        match expected {
            Some(ours) if ours == info_hash => {}
            _ => return Err(PeerError::UnknownInfoHash),
        }
        self.torrent = Some(info_hash);
        self.peer_id = PeerId::from_bytes(&hs.peer_id);
        self.supports_extensions = hs.supports_extensions();
        self.supports_fast = hs.supports_fast();
        self.supports_dht = hs.supports_dht();
        self.state = PeerState::Active;
        self.last_received = now;
        trace!(conn = self.id.0, peer = ?self.peer_id, "handshake complete");
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state == PeerState::Active
    }

    pub fn is_disconnecting(&self) -> bool {
        self.state == PeerState::Disconnecting
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.state, PeerState::Connecting | PeerState::Handshaking)
    }

    /// The single disconnect entry point. Records the reason, drops both
    /// queues and tells the pump to exit. Idempotent: only the first
    /// reason is kept.
    pub fn start_disconnect(&mut self, error: PeerError, op: DisconnectOp) {
        if self.state == PeerState::Disconnecting {
            return;
        }
        debug!(conn = self.id.0, addr = %self.addr, %error, ?op, "disconnecting");
        self.state = PeerState::Disconnecting;
        self.disconnect_reason = Some((error, op));
        self.requests.clear();
        self.upload_queue.clear();
        self.pump.close();
    }

    /// True once the pump task has exited and the connection can be
    /// dropped from the undead list.
    pub fn pump_finished(&self) -> bool {
        self.pump.is_finished()
    }

    // ------------------------------------------------------------------
    // sending
    // ------------------------------------------------------------------

    /// Encodes and queues a message on the pump, tracking the send
    /// buffer and outbound timers.
    pub fn send(&mut self, msg: &Message, now: Instant) {
        if self.state == PeerState::Disconnecting {
            return;
        }
        if let Message::Piece { data, .. } = msg {
            self.stats.uploaded += data.len() as u64;
        }
        let queued = self.pump.send(msg.encode());
        self.send_buffer += queued;
        self.last_sent = now;
    }

    /// The pump wrote bytes; shrink the tracked send buffer.
    pub fn on_bytes_written(&mut self, n: usize) {
        self.send_buffer = self.send_buffer.saturating_sub(n);
    }

    /// Send-buffer watermark: proportional to the peer's upload rate
    /// (three seconds of it), with a floor. Beyond it the engine delays
    /// disk reads for this peer.
    pub fn send_buffer_full(&self) -> bool {
        let watermark = (self.stats.upload_rate as usize * 3).max(SEND_BUFFER_WATERMARK_MIN);
        self.send_buffer >= watermark
    }

    /// Sends our handshake; used for incoming connections once the info
    /// hash has been matched.
    pub fn send_handshake(&mut self, hs: &Handshake, now: Instant) {
        let queued = self.pump.send(hs.encode());
        self.send_buffer += queued;
        self.last_sent = now;
    }

    // ------------------------------------------------------------------
    // choking and interest
    // ------------------------------------------------------------------

    /// Chokes the peer and drops its queued requests, per protocol.
    /// Returns false if the peer was already choked.
    pub fn choke(&mut self, now: Instant) -> bool {
        if self.am_choking {
            return false;
        }
        self.am_choking = true;
        self.upload_queue.clear();
        self.send(&Message::Choke, now);
        true
    }

    /// Returns false if the peer was already unchoked.
    pub fn unchoke(&mut self, now: Instant) -> bool {
        if !self.am_choking {
            return false;
        }
        self.am_choking = false;
        self.send(&Message::Unchoke, now);
        true
    }

    pub fn set_interested(&mut self, interested: bool, now: Instant) {
        if self.am_interested == interested {
            return;
        }
        self.am_interested = interested;
        self.send(
            if interested {
                &Message::Interested
            } else {
                &Message::NotInterested
            },
            now,
        );
    }

    // ------------------------------------------------------------------
    // request pipeline
    // ------------------------------------------------------------------

    /// Free slots in the outbound request window.
    pub fn request_slots(&self) -> usize {
        if self.peer_choking || !self.am_interested {
            return 0;
        }
        self.effective_window().saturating_sub(self.requests.len())
    }

    /// The AIMD window, additionally capped by what the peer's observed
    /// rate can keep busy over a few seconds of pipeline.
    fn effective_window(&self) -> usize {
        let rate_target = (self.stats.download_rate as usize * 3) / BLOCK_SIZE as usize;
        self.request_window
            .min(self.max_request_window)
            .max(rate_target.min(self.max_request_window))
            .max(INITIAL_REQUEST_WINDOW)
    }

    /// Records an outbound request and sends it.
    pub fn push_request(&mut self, block: BlockRef, now: Instant) {
        self.requests.push_back(PendingRequest {
            block,
            sent_at: now,
        });
        self.send(
            &Message::Request {
                index: block.piece,
                begin: block.offset,
                length: block.length,
            },
            now,
        );
    }

    /// Sends a cancel for an in-flight request (endgame duplicates).
    pub fn cancel_request(&mut self, block: BlockRef, now: Instant) {
        if let Some(pos) = self.requests.iter().position(|r| r.block == block) {
            self.requests.remove(pos);
            self.send(
                &Message::Cancel {
                    index: block.piece,
                    begin: block.offset,
                    length: block.length,
                },
                now,
            );
        }
    }

    /// Sweeps requests older than the request timeout. Returns the timed
    /// out blocks for the picker to re-queue; the window is halved once
    /// per sweep that found anything (the MD in AIMD).
    pub fn sweep_request_timeouts(&mut self, now: Instant) -> Vec<BlockRef> {
        let mut lost = Vec::new();
        while let Some(front) = self.requests.front() {
            if now.duration_since(front.sent_at) < REQUEST_TIMEOUT {
                break;
            }
            lost.push(self.requests.pop_front().expect("front checked").block);
        }
        if !lost.is_empty() {
            self.request_window = (self.request_window / 2).max(INITIAL_REQUEST_WINDOW);
            self.snubbed = true;
        }
        lost
    }

    /// Trust bookkeeping after a piece this peer contributed to failed
    /// its hash. Over the threshold the connection must go.
    pub fn on_hashfail(&mut self) -> Result<(), PeerError> {
        self.hashfails += 1;
        if self.hashfails >= HASHFAIL_THRESHOLD {
            Err(PeerError::HashFailures)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // inbound messages
    // ------------------------------------------------------------------

    /// Applies one wire message to the state machine.
    ///
    /// Validation that needs torrent metadata (piece count, request
    /// bounds) is the caller's job; everything connection-local happens
    /// here.
    pub fn handle_message(&mut self, msg: Message, now: Instant) -> Result<Incoming, PeerError> {
        self.last_received = now;
        match msg {
            Message::KeepAlive => Ok(Incoming::None),

            Message::Choke => {
                self.peer_choking = true;
                // a choking peer drops our queued requests unless it
                // speaks the fast extension and rejects them explicitly
                let lost = if self.supports_fast {
                    Vec::new()
                } else {
                    self.requests.drain(..).map(|r| r.block).collect()
                };
                Ok(Incoming::ChokedUs { lost })
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.snubbed = false;
                Ok(Incoming::Unchoked)
            }
            Message::Interested => {
                self.peer_interested = true;
                Ok(Incoming::InterestChanged)
            }
            Message::NotInterested => {
                self.peer_interested = false;
                Ok(Incoming::InterestChanged)
            }

            Message::Have { piece } => {
                if let Some(bf) = &mut self.peer_bitfield {
                    if piece as usize >= bf.num_pieces() {
                        return Err(PeerError::InvalidMessage("have out of range"));
                    }
                    bf.set(piece as usize);
                }
                Ok(Incoming::Have(piece))
            }
            Message::Bitfield(bits) => Ok(Incoming::Bitfield(bits)),
            Message::HaveAll => {
                if !self.supports_fast {
                    return Err(PeerError::InvalidMessage("have-all without fast"));
                }
                Ok(Incoming::HaveAll)
            }
            Message::HaveNone => {
                if !self.supports_fast {
                    return Err(PeerError::InvalidMessage("have-none without fast"));
                }
                Ok(Incoming::HaveNone)
            }

            Message::Request {
                index,
                begin,
                length,
            } => {
                self.requests_this_tick += 1;
                if self.requests_this_tick > self.max_requests_per_tick {
                    return Err(PeerError::ExcessiveRequests);
                }
                if length > crate::constants::MAX_REQUEST_LENGTH {
                    return Err(PeerError::RequestOutOfRange);
                }
                if self.am_choking {
                    // ignore requests from choked peers; fast-extension
                    // peers get an explicit reject from the engine
                    return Ok(Incoming::None);
                }
                let block = BlockRef {
                    piece: index,
                    offset: begin,
                    length,
                };
                if self.upload_queue.len() >= self.max_upload_queue {
                    // silently drop overflow, matching the reqq contract
                    return Ok(Incoming::None);
                }
                self.upload_queue.push_back(block);
                Ok(Incoming::Request(block))
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let block = BlockRef {
                    piece: index,
                    offset: begin,
                    length,
                };
                if let Some(pos) = self.upload_queue.iter().position(|b| *b == block) {
                    self.upload_queue.remove(pos);
                }
                Ok(Incoming::CancelUpload(block))
            }

            Message::Piece { index, begin, data } => {
                let block = BlockRef {
                    piece: index,
                    offset: begin,
                    length: data.len() as u32,
                };
                let Some(pos) = self.requests.iter().position(|r| r.block == block) else {
                    // unsolicited or already-cancelled block; harmless
                    return Ok(Incoming::None);
                };
                self.requests.remove(pos);
                self.stats.downloaded += data.len() as u64;
                self.snubbed = false;
                // additive window growth, one slot per delivered block
                if self.request_window < self.max_request_window {
                    self.request_window += 1;
                }
                Ok(Incoming::Block { block, data })
            }
            Message::Reject {
                index,
                begin,
                length,
            } => {
                if !self.supports_fast {
                    return Err(PeerError::InvalidMessage("reject without fast"));
                }
                let block = BlockRef {
                    piece: index,
                    offset: begin,
                    length,
                };
                if let Some(pos) = self.requests.iter().position(|r| r.block == block) {
                    self.requests.remove(pos);
                }
                Ok(Incoming::Rejected(block))
            }
            Message::Suggest { piece } | Message::AllowedFast { piece } => {
                if !self.supports_fast {
                    return Err(PeerError::InvalidMessage("fast message without fast"));
                }
                let _ = piece;
                Ok(Incoming::None)
            }

            Message::DhtPort(port) => Ok(Incoming::DhtPort(port)),

            Message::Extended { id, payload } => {
                if !self.supports_extensions {
                    return Err(PeerError::InvalidMessage("extended without extension bit"));
                }
                if id == crate::constants::EXTENSION_HANDSHAKE_ID {
                    self.extended = Some(ExtensionHandshake::decode(&payload)?);
                    if let Some(reqq) = self.extended.as_ref().and_then(|e| e.reqq) {
                        self.max_request_window =
                            self.max_request_window.min(reqq.max(1) as usize);
                    }
                    Ok(Incoming::ExtendedHandshake)
                } else {
                    // unknown negotiated extension payloads are ignored
                    Ok(Incoming::None)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // tick
    // ------------------------------------------------------------------

    /// Timer pass, called once per engine tick. Resets the per-tick
    /// request budget and checks keep-alive and inactivity deadlines.
    pub fn tick(&mut self, now: Instant) -> TickAction {
        self.requests_this_tick = 0;

        match self.state {
            PeerState::Connecting | PeerState::Handshaking => {
                if now.duration_since(self.connected_at) > crate::constants::HANDSHAKE_TIMEOUT {
                    return TickAction::Timeout;
                }
                TickAction::None
            }
            PeerState::Active => {
                if now.duration_since(self.last_received) > INACTIVITY_TIMEOUT {
                    return TickAction::Timeout;
                }
                if now.duration_since(self.last_sent) > KEEPALIVE_INTERVAL {
                    return TickAction::SendKeepAlive;
                }
                TickAction::None
            }
            PeerState::Disconnecting => TickAction::None,
        }
    }
}
