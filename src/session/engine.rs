//! The session engine: one task owning every torrent, connection,
//! listen socket and discovery service, driven by a per-second tick.
//!
//! Nothing here is shared: user threads talk to the engine through the
//! command channel, socket pumps and helper tasks talk to it through
//! event channels, and the engine answers through the alert queue. One
//! tick sees one cached clock reading; callbacks run to completion, so
//! any invariant established inside a handler holds until it yields.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::alert::{Alert, AlertQueue, TorrentStatus};
use super::auto_manage::{recalculate_auto_managed_torrents, AutoManageEntry};
use super::connect::{AttemptOutcome, ConnectPump, PumpContext};
use super::lists::{ListKind, TorrentLists};
use super::listen::{open_listen_sockets, AcceptEvent, ListenSocket};
use super::lru::LoadedLru;
use super::settings::SessionSettings;
use super::state::{load_state, save_state, SavedSettings, SavedState};
use super::unchoke::{
    recalculate_optimistic_unchoke_slots, recalculate_unchoke_slots, UnchokeCandidate,
};
use super::{AddTorrentParams, Command};
use crate::bandwidth::{Channel, ChannelLimiter};
use crate::classes::{ClassRegistry, IpClassFilter, SocketKind, TypeClassFilter};
use crate::clock::Clock;
use crate::constants::DHT_BOOTSTRAP_NODES;
use crate::dht::{DhtEvent, DhtNode, NodeId};
use crate::gate::HalfOpenGate;
use crate::lsd::{LsdPeer, LsdService};
use crate::meta::InfoHash;
use crate::peer::{
    spawn_incoming, spawn_outgoing, spawn_outgoing_stream, Bitfield, ConnId, DisconnectOp,
    ExtensionHandshake, Handshake, Incoming, Message, PeerConnection, PeerError, PeerStream,
    PumpEvent, PumpLimits, TickAction,
};
use crate::portmap::{MapProtocol, PortMapState};
use crate::storage::{DiskIo, StorageError};
use crate::torrent::picker::BlockRef;
use crate::torrent::resume::ResumeData;
use crate::torrent::{BlockResult, Torrent, TorrentState};
use crate::tracker::{
    AnnounceRequest, HttpTracker, TrackerError, TrackerEvent, TrackerRouter, UdpTracker,
};
use crate::utp::{self, AppCommand, UtpManager};

/// Disk completions re-entering the engine.
enum DiskEvent {
    WriteDone {
        info_hash: InfoHash,
        piece: u32,
        result: Result<(), StorageError>,
    },
    ReadDone {
        conn: ConnId,
        info_hash: InfoHash,
        block: BlockRef,
        result: Result<Bytes, StorageError>,
    },
}

/// Tracker announce results re-entering the engine.
struct TrackerOutcome {
    info_hash: InfoHash,
    url: String,
    event: TrackerEvent,
    result: Result<crate::tracker::AnnounceResponse, TrackerError>,
}

/// Scrape results re-entering the engine.
struct ScrapeOutcome {
    info_hash: InfoHash,
    result: Result<crate::tracker::ScrapeResponse, TrackerError>,
}

pub struct Engine {
    settings: SessionSettings,
    clock: Clock,
    alerts: Arc<AlertQueue>,
    disk: Arc<dyn DiskIo>,
    peer_id: crate::peer::PeerId,
    tracker_key: u32,

    cmd_rx: mpsc::UnboundedReceiver<Command>,

    torrents: HashMap<InfoHash, Torrent>,
    /// The session's weak view over all connections (I1): which torrent
    /// owns each, `None` while an incoming handshake is pending.
    conn_index: HashMap<ConnId, Option<InfoHash>>,
    /// Incoming connections that have not matched a torrent yet.
    pending: HashMap<ConnId, PeerConnection>,
    /// Disconnected connections whose pump has not exited yet.
    undead: Vec<PeerConnection>,
    next_conn_id: u64,

    lists: TorrentLists,
    lru: LoadedLru,
    gate: HalfOpenGate,
    classes: ClassRegistry,
    ip_filter: IpClassFilter,
    type_filter: TypeClassFilter,
    pump: ConnectPump,
    portmap: PortMapState,

    listen_sockets: Vec<ListenSocket>,
    /// Scopes acceptor/reader tasks to the current listen generation;
    /// replacing it on rebind winds the old tasks down.
    listen_shutdown: watch::Sender<()>,
    tracker_router: Arc<TrackerRouter>,
    dht: Option<DhtNode>,
    lsd: Option<Arc<LsdService>>,
    utp: UtpManager,

    // event plumbing
    peer_tx: mpsc::UnboundedSender<(ConnId, PumpEvent)>,
    peer_rx: mpsc::UnboundedReceiver<(ConnId, PumpEvent)>,
    incoming_tx: mpsc::UnboundedSender<AcceptEvent>,
    incoming_rx: mpsc::UnboundedReceiver<AcceptEvent>,
    udp_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    udp_rx: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    lsd_tx: mpsc::UnboundedSender<LsdPeer>,
    lsd_rx: mpsc::UnboundedReceiver<LsdPeer>,
    utp_app_rx: mpsc::UnboundedReceiver<(u16, AppCommand)>,
    disk_tx: mpsc::UnboundedSender<DiskEvent>,
    disk_rx: mpsc::UnboundedReceiver<DiskEvent>,
    tracker_tx: mpsc::UnboundedSender<TrackerOutcome>,
    tracker_rx: mpsc::UnboundedReceiver<TrackerOutcome>,
    scrape_tx: mpsc::UnboundedSender<ScrapeOutcome>,
    scrape_rx: mpsc::UnboundedReceiver<ScrapeOutcome>,

    /// Announces currently in flight, to avoid duplicates.
    announcing: HashSet<(InfoHash, String)>,

    // scheduling state
    tick_count: u64,
    session_paused: bool,
    aborting: bool,
    num_unchoked: usize,
    allowed_upload_slots: usize,
    dht_announce_cursor: usize,
    lsd_announce_cursor: usize,
    max_queue_pos: i64,
}

impl Engine {
    pub fn new(
        settings: SessionSettings,
        disk: Arc<dyn DiskIo>,
        alerts: Arc<AlertQueue>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (udp_tx, udp_rx) = mpsc::unbounded_channel();
        let (lsd_tx, lsd_rx) = mpsc::unbounded_channel();
        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        let (tracker_tx, tracker_rx) = mpsc::unbounded_channel();
        let (scrape_tx, scrape_rx) = mpsc::unbounded_channel();
        let (utp, utp_app_rx) = UtpManager::new();

        let gate = HalfOpenGate::new(settings.half_open_limit);
        let allowed_upload_slots = settings.unchoke_slots;

        let mut classes = ClassRegistry::new();
        let global = classes.global;
        classes.set_rate(global, Channel::Upload, settings.upload_rate_limit);
        classes.set_rate(global, Channel::Download, settings.download_rate_limit);

        Self {
            settings,
            clock: Clock::new(),
            alerts,
            disk,
            peer_id: crate::peer::PeerId::generate(),
            tracker_key: rand::random(),
            cmd_rx,
            torrents: HashMap::new(),
            conn_index: HashMap::new(),
            pending: HashMap::new(),
            undead: Vec::new(),
            next_conn_id: 1,
            lists: TorrentLists::new(),
            lru: LoadedLru::new(),
            gate,
            classes,
            ip_filter: IpClassFilter::new(),
            type_filter: TypeClassFilter::new(),
            pump: ConnectPump::new(),
            portmap: PortMapState::new(),
            listen_sockets: Vec::new(),
            listen_shutdown: watch::channel(()).0,
            tracker_router: TrackerRouter::new(),
            dht: None,
            lsd: None,
            utp,
            peer_tx,
            peer_rx,
            incoming_tx,
            incoming_rx,
            udp_tx,
            udp_rx,
            lsd_tx,
            lsd_rx,
            utp_app_rx,
            disk_tx,
            disk_rx,
            tracker_tx,
            tracker_rx,
            scrape_tx,
            scrape_rx,
            announcing: HashSet::new(),
            tick_count: 0,
            session_paused: false,
            aborting: false,
            num_unchoked: 0,
            allowed_upload_slots,
            dht_announce_cursor: 0,
            lsd_announce_cursor: 0,
            max_queue_pos: -1,
        }
    }

    pub async fn run(mut self) {
        self.startup().await;

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.on_tick();
                    if self.aborting && self.shutdown_drained() {
                        break;
                    }
                }
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd).await,
                Some((id, event)) = self.peer_rx.recv() => self.on_peer_event(id, event),
                Some(accepted) = self.incoming_rx.recv() => self.on_accept_event(accepted),
                Some((data, source)) = self.udp_rx.recv() => self.on_udp(data, source),
                Some(peer) = self.lsd_rx.recv() => self.on_lsd_peer(peer),
                Some((conn, cmd)) = self.utp_app_rx.recv() => {
                    let now = self.clock.now();
                    self.utp.on_app_command(conn, cmd, now);
                    self.flush_udp();
                }
                Some(event) = self.disk_rx.recv() => self.on_disk_event(event),
                Some(outcome) = self.tracker_rx.recv() => self.on_tracker_outcome(outcome),
                Some(outcome) = self.scrape_rx.recv() => self.on_scrape_outcome(outcome),
            }
        }

        info!("engine stopped");
    }

    async fn startup(&mut self) {
        self.clock.tick();
        self.rebind_listeners().await;

        if self.settings.enable_dht {
            let now = self.clock.now();
            let mut dht = DhtNode::new(NodeId::generate(), now);
            let lookups = futures::future::join_all(
                DHT_BOOTSTRAP_NODES
                    .iter()
                    .map(|name| tokio::net::lookup_host(*name)),
            )
            .await;
            let seeds: Vec<SocketAddr> = lookups
                .into_iter()
                .flatten()
                .flatten()
                .filter(|a| a.is_ipv4())
                .collect();
            if !seeds.is_empty() {
                dht.start_bootstrap(seeds, now);
            }
            self.dht = Some(dht);
        }

        if self.settings.enable_lsd {
            match LsdService::bind().await {
                Ok(service) => {
                    let service = Arc::new(service);
                    service.start(self.lsd_tx.clone());
                    self.lsd = Some(service);
                }
                Err(e) => warn!(error = %e, "lsd disabled"),
            }
        }

        self.flush_udp();
    }

    /// (Re)binds the configured listen interfaces, retiring the tasks
    /// of the previous generation, and remaps router ports.
    async fn rebind_listeners(&mut self) {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        self.listen_sockets = open_listen_sockets(
            &self.settings,
            &self.alerts,
            self.incoming_tx.clone(),
            self.udp_tx.clone(),
            shutdown_rx,
        )
        .await;
        // dropping the previous sender stops the old generation's tasks
        self.listen_shutdown = shutdown_tx;

        if let Some(port) = self.listen_port() {
            self.remap_ports(port);
        }
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    fn listen_port(&self) -> Option<u16> {
        self.listen_sockets.first().map(|s| s.local_port)
    }

    /// The port advertised to trackers and the DHT (external when a
    /// mapping succeeded).
    fn advertised_port(&self) -> u16 {
        self.listen_sockets
            .first()
            .map(|s| s.advertised_port())
            .unwrap_or(0)
    }

    fn udp_socket(&self) -> Option<Arc<tokio::net::UdpSocket>> {
        self.listen_sockets.first().map(|s| Arc::clone(&s.udp))
    }

    fn send_udp(&self, packets: Vec<(Vec<u8>, SocketAddr)>) {
        let Some(socket) = self.udp_socket() else {
            return;
        };
        if packets.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for (packet, addr) in packets {
                let _ = socket.send_to(&packet, addr).await;
            }
        });
    }

    /// Drains DHT and uTP outbound queues onto the socket.
    fn flush_udp(&mut self) {
        let mut packets = Vec::new();
        if let Some(dht) = &mut self.dht {
            packets.append(&mut dht.take_outgoing());
        }
        packets.append(&mut self.utp.take_outgoing());
        self.send_udp(packets);
    }

    fn num_connections(&self) -> usize {
        self.conn_index.len()
    }

    fn conn_mut(&mut self, id: ConnId) -> Option<&mut PeerConnection> {
        match self.conn_index.get(&id) {
            Some(Some(hash)) => self.torrents.get_mut(hash)?.peers.get_mut(&id),
            Some(None) => self.pending.get_mut(&id),
            None => None,
        }
    }

    /// Re-evaluates every list predicate for one torrent (I2).
    fn refresh_lists(&mut self, hash: InfoHash) {
        let Some(torrent) = self.torrents.get_mut(&hash) else {
            return;
        };
        let memberships = [
            (ListKind::WantTick, torrent.want_tick()),
            (ListKind::WantPeersDownload, torrent.want_peers_download()),
            (ListKind::WantPeersFinished, torrent.want_peers_finished()),
            (ListKind::WantScrape, torrent.want_scrape()),
            (ListKind::StateUpdates, torrent.state_dirty),
        ];
        let mut positions = torrent.list_pos;
        let mut fixups = Vec::new();
        for (kind, belongs) in memberships {
            if let Some(fixup) = self.lists.update(kind, hash, &mut positions, belongs) {
                fixups.push((kind, fixup));
            }
        }
        self.torrents.get_mut(&hash).expect("torrent present").list_pos = positions;
        for (kind, (moved, pos)) in fixups {
            if let Some(other) = self.torrents.get_mut(&moved) {
                other.list_pos.set(kind, pos);
            }
        }
    }

    fn build_limits(&self, addr: SocketAddr, kind: SocketKind) -> (PumpLimits, Vec<crate::classes::ClassId>) {
        let mut class_set = vec![self.classes.global];
        class_set.extend(self.ip_filter.classes_for(addr.ip()));
        class_set.extend(self.type_filter.classes_for(kind).iter().copied());

        let mut up = Vec::new();
        let mut down = Vec::new();
        for &id in &class_set {
            if let Some(class) = self.classes.get(id) {
                up.push(class.bucket(Channel::Upload));
                down.push(class.bucket(Channel::Download));
            }
        }
        (
            PumpLimits {
                upload: ChannelLimiter::new(up),
                download: ChannelLimiter::new(down),
            },
            class_set,
        )
    }

    // ------------------------------------------------------------------
    // commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddTorrent(params) => self.add_torrent(*params),
            Command::RemoveTorrent {
                info_hash,
                delete_files,
            } => self.remove_torrent(info_hash, delete_files),
            Command::PauseTorrent { info_hash, graceful } => {
                let now = self.clock.now();
                if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                    torrent.pause(graceful, now);
                    torrent.auto_managed = false;
                    self.alerts.post(Alert::TorrentPaused { info_hash });
                }
                self.refresh_lists(info_hash);
            }
            Command::ResumeTorrent { info_hash } => {
                let session_time = self.clock.session_time();
                if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                    torrent.resume(session_time);
                    self.alerts.post(Alert::TorrentResumed { info_hash });
                }
                // resuming counts as access for the loaded-torrent LRU
                self.touch_torrent(info_hash);
                self.refresh_lists(info_hash);
            }
            Command::PauseSession => {
                self.session_paused = true;
            }
            Command::ResumeSession => {
                self.session_paused = false;
            }
            Command::ApplySettings(settings) => self.apply_settings(*settings),
            Command::ListenOn(interfaces) => {
                if !self.aborting {
                    self.settings.listen_interfaces = interfaces;
                    self.rebind_listeners().await;
                }
            }
            Command::AddPortMapper(mapper) => {
                self.portmap.add_mapper(mapper);
                if let Some(port) = self.listen_port() {
                    self.remap_ports(port);
                }
            }
            Command::AddPeer { info_hash, addr } => {
                if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                    torrent.add_candidates([addr]);
                }
                self.refresh_lists(info_hash);
            }
            Command::AddDhtNode(addr) => {
                let now = self.clock.now();
                if let Some(dht) = &mut self.dht {
                    dht.add_node(addr, now);
                }
                self.flush_udp();
            }
            Command::AddPeerClass { label, reply } => {
                let _ = reply.send(self.classes.add(&label));
            }
            Command::SetPeerClassRate {
                class,
                channel,
                rate,
            } => {
                self.classes.set_rate(class, channel, rate);
            }
            Command::AddIpFilterRule { first, last, class } => {
                self.ip_filter.add_rule(first, last, class);
            }
            Command::AddTypeFilterRule { kind, class } => {
                self.type_filter.add(kind, class);
            }
            Command::SetQueuePosition {
                info_hash,
                position,
            } => self.set_queue_position(info_hash, position),
            Command::PostTorrentUpdates => self.post_torrent_updates(),
            Command::SaveState(reply) => {
                let state = SavedState {
                    settings: Some(SavedSettings::from_settings(&self.settings)),
                    dht_state: self.dht.as_ref().map(|d| d.save_state()),
                    tracker_key: Some(self.tracker_key),
                };
                let _ = reply.send(save_state(&state));
            }
            Command::LoadState(data) => match load_state(&data) {
                Ok(state) => {
                    if let Some(saved) = state.settings {
                        saved.apply_to(&mut self.settings);
                    }
                    if let Some(key) = state.tracker_key {
                        self.tracker_key = key;
                    }
                    if let (Some(dht), Some(section)) = (&mut self.dht, state.dht_state.as_ref()) {
                        dht.load_state(section);
                    }
                }
                Err(e) => warn!(error = %e, "ignoring unreadable session state"),
            },
            Command::Shutdown => self.begin_shutdown(),
        }
    }

    fn apply_settings(&mut self, settings: SessionSettings) {
        self.gate.set_limit(settings.half_open_limit);
        self.alerts.set_limit(settings.alert_queue_size);
        let global = self.classes.global;
        self.classes
            .set_rate(global, Channel::Upload, settings.upload_rate_limit);
        self.classes
            .set_rate(global, Channel::Download, settings.download_rate_limit);
        self.settings = settings;
        // eviction limit may have tightened
        self.evict_loaded(None);
    }

    fn add_torrent(&mut self, params: AddTorrentParams) {
        let info_hash = match (&params.meta, params.info_hash) {
            (Some(meta), _) => meta.info_hash,
            (None, Some(hash)) => hash,
            (None, None) => return,
        };
        if self.torrents.contains_key(&info_hash) {
            self.alerts.post(Alert::TorrentError {
                info_hash,
                message: "duplicate torrent".to_string(),
            });
            return;
        }

        let mut torrent = Torrent::new(
            info_hash,
            params.meta,
            self.settings.max_connections_per_torrent,
        );
        torrent.auto_managed = params.auto_managed;
        torrent.pinned = params.pinned;
        torrent.started_at = self.clock.session_time();
        for (url, tier) in params.trackers {
            torrent.trackers.add(url, tier);
        }
        if params.paused {
            torrent.paused = true;
        }

        if let Some(resume) = params.resume {
            self.apply_resume(&mut torrent, resume);
        }

        // queue position: appended at the back of the download queue
        if !torrent.is_finished() {
            self.max_queue_pos += 1;
            torrent.queue_pos = self.max_queue_pos;
        }

        let loaded = torrent.is_loaded();
        let pinned = torrent.pinned;
        self.torrents.insert(info_hash, torrent);
        if loaded && !pinned {
            self.lru.bump(info_hash);
            self.evict_loaded(Some(info_hash));
        }
        self.alerts.post(Alert::TorrentAdded { info_hash });
        self.refresh_lists(info_hash);
        debug!(torrent = %info_hash, "torrent added");
    }

    fn apply_resume(&mut self, torrent: &mut Torrent, resume: ResumeData) {
        if resume.info_hash != torrent.info_hash {
            return;
        }
        for (url, tier) in resume.trackers {
            torrent.trackers.add(url, tier);
        }
        torrent.add_candidates(resume.peers.iter().copied());
        if let (Some(meta), Some(picker)) = (&torrent.meta, &mut torrent.picker) {
            let have = Bitfield::from_wire(&resume.pieces, meta.num_pieces() as usize);
            if let Some(have) = have {
                for piece in have.iter_set() {
                    picker.set_have(piece as u32);
                }
                for (piece, priority) in resume.piece_priority.iter().enumerate() {
                    picker.set_priority(piece as u32, *priority);
                }
                if picker.is_finished() {
                    torrent.state = TorrentState::Seeding;
                    torrent.seeding_since = Some(self.clock.session_time());
                }
            } else {
                // stale bitfield; verify everything instead
                torrent.state = TorrentState::CheckingFiles;
            }
        }
    }

    fn remove_torrent(&mut self, info_hash: InfoHash, delete_files: bool) {
        let Some(mut torrent) = self.torrents.remove(&info_hash) else {
            return;
        };
        // detach every peer
        let ids: Vec<ConnId> = torrent.peers.keys().copied().collect();
        for id in ids {
            if let Some(mut peer) = torrent.peers.remove(&id) {
                if !peer.am_choking && !self.classes.ignores_unchoke_slots(&peer.classes) {
                    self.num_unchoked = self.num_unchoked.saturating_sub(1);
                }
                for class in peer.classes.clone() {
                    self.classes.decref(class);
                }
                peer.start_disconnect(PeerError::SessionClosing, DisconnectOp::Abort);
                self.conn_index.remove(&id);
                self.undead.push(peer);
            }
        }
        // stopped announce to every tracker we had started with
        for url in torrent.trackers.started_urls() {
            self.spawn_announce(info_hash, url, TrackerEvent::Stopped, 0, 0, 0);
        }
        // drop list memberships
        let mut positions = torrent.list_pos;
        for kind in [
            ListKind::WantTick,
            ListKind::WantPeersDownload,
            ListKind::WantPeersFinished,
            ListKind::WantScrape,
            ListKind::StateUpdates,
        ] {
            if let Some((moved, pos)) = self.lists.update(kind, info_hash, &mut positions, false) {
                if let Some(other) = self.torrents.get_mut(&moved) {
                    other.list_pos.set(kind, pos);
                }
            }
        }
        self.lru.remove(info_hash);
        if delete_files {
            self.disk.delete_torrent(info_hash);
        }
        // compact queue positions above the removed torrent (I6)
        if torrent.queue_pos >= 0 {
            for other in self.torrents.values_mut() {
                if other.queue_pos > torrent.queue_pos {
                    other.queue_pos -= 1;
                }
            }
            self.max_queue_pos -= 1;
        }
        self.alerts.post(Alert::TorrentRemoved { info_hash });
    }

    fn set_queue_position(&mut self, info_hash: InfoHash, position: i64) {
        let Some(current) = self.torrents.get(&info_hash).map(|t| t.queue_pos) else {
            return;
        };
        if current < 0 {
            return;
        }
        let target = position.clamp(0, self.max_queue_pos);
        for torrent in self.torrents.values_mut() {
            if torrent.info_hash == info_hash {
                torrent.queue_pos = target;
            } else if current < target
                && torrent.queue_pos > current
                && torrent.queue_pos <= target
            {
                torrent.queue_pos -= 1;
            } else if current > target
                && torrent.queue_pos >= target
                && torrent.queue_pos < current
            {
                torrent.queue_pos += 1;
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if self.aborting {
            return;
        }
        info!("session shutting down");
        self.aborting = true;
        let now = self.clock.now();

        let ids: Vec<ConnId> = self.conn_index.keys().copied().collect();
        for id in ids {
            self.disconnect_conn(id, PeerError::SessionClosing, DisconnectOp::Abort);
        }
        if let Some(dht) = &mut self.dht {
            dht.abort();
        }
        self.utp.close_all(now);
        self.flush_udp();
        self.portmap.clear();
    }

    /// Shutdown completes once uTP sockets finished their graceful
    /// close and all pumps exited.
    fn shutdown_drained(&mut self) -> bool {
        self.undead.retain(|c| !c.pump_finished());
        self.utp.drained() && self.undead.is_empty() && self.pending.is_empty()
    }

    // ------------------------------------------------------------------
    // incoming connections
    // ------------------------------------------------------------------

    fn on_accept_event(&mut self, event: AcceptEvent) {
        match event {
            Ok((stream, addr)) => self.on_incoming_tcp(stream, addr),
            Err(e) => {
                // running out of descriptors sheds load aggressively:
                // one peer from the largest torrent goes, and the
                // global limit clamps to what we have
                warn!(error = %e, "accept failed");
                // EMFILE on unix
                if e.raw_os_error() == Some(24) {
                    let victim = self
                        .torrents
                        .values()
                        .max_by_key(|t| t.peers.len())
                        .and_then(|t| t.peers.keys().next().copied());
                    if let Some(id) = victim {
                        self.disconnect_conn(
                            id,
                            PeerError::Io(std::io::Error::from(
                                std::io::ErrorKind::Other,
                            )),
                            DisconnectOp::Abort,
                        );
                    }
                    self.settings.connections_limit = self.num_connections().max(2);
                }
            }
        }
    }

    fn on_incoming_tcp(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.aborting || self.session_paused {
            return;
        }
        // incoming connections may use the slack above the limit
        if self.num_connections()
            >= self.settings.connections_limit + self.settings.connections_slack
        {
            debug!(%addr, "incoming connection over limit, dropped");
            return;
        }

        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        let (limits, class_set) = self.build_limits(addr, SocketKind::Tcp);
        let pump = spawn_incoming(id, PeerStream::Tcp(stream), limits, self.peer_tx.clone());
        let now = self.clock.now();
        let conn = PeerConnection::new(
            id,
            addr,
            SocketKind::Tcp,
            false,
            None,
            class_set.clone(),
            self.settings.max_allowed_in_request_queue,
            self.settings.max_requests_per_tick,
            self.settings.max_out_request_queue,
            pump,
            now,
        );
        for class in class_set {
            self.classes.incref(class);
        }
        self.pending.insert(id, conn);
        self.conn_index.insert(id, None);
    }

    // ------------------------------------------------------------------
    // peer events
    // ------------------------------------------------------------------

    fn on_peer_event(&mut self, id: ConnId, event: PumpEvent) {
        match event {
            PumpEvent::Connected => {
                let now = self.clock.now();
                if let Some(conn) = self.conn_mut(id) {
                    conn.on_transport_connected(now);
                }
            }
            PumpEvent::Wrote(n) => {
                if let Some(conn) = self.conn_mut(id) {
                    conn.on_bytes_written(n);
                }
            }
            PumpEvent::Handshake(hs) => self.on_handshake(id, hs),
            PumpEvent::Message(msg) => self.on_message(id, msg),
            PumpEvent::Error(e) => {
                let op = match self.conn_mut(id).map(|c| c.state) {
                    Some(crate::peer::PeerState::Connecting) => DisconnectOp::Connect,
                    Some(crate::peer::PeerState::Handshaking) => DisconnectOp::Handshake,
                    _ => DisconnectOp::Read,
                };
                self.disconnect_conn(id, e, op);
            }
            PumpEvent::Closed => {
                self.disconnect_conn(id, PeerError::ConnectionClosed, DisconnectOp::Read);
            }
        }
    }

    fn on_handshake(&mut self, id: ConnId, hs: Handshake) {
        let now = self.clock.now();
        let claimed = InfoHash(hs.info_hash);
        let known = self.torrents.contains_key(&claimed);
        let was_pending = matches!(self.conn_index.get(&id), Some(None));

        let Some(conn) = self.conn_mut(id) else {
            return;
        };
        let expected = if conn.outgoing {
            conn.torrent
        } else if known {
            Some(claimed)
        } else {
            None
        };
        match conn.on_handshake(&hs, expected, now) {
            Ok(()) => {}
            Err(e) => {
                self.disconnect_conn(id, e, DisconnectOp::Handshake);
                return;
            }
        }

        // incoming: reply with our handshake and attach to the torrent
        if was_pending {
            let our_hs = Handshake::new(claimed.0, self.peer_id.0);
            let mut conn = self.pending.remove(&id).expect("pending connection");
            conn.send_handshake(&our_hs, now);
            self.conn_index.insert(id, Some(claimed));
            if let Some(torrent) = self.torrents.get_mut(&claimed) {
                if torrent.peers.len() >= torrent.max_connections || !torrent.allow_peers {
                    conn.start_disconnect(PeerError::SessionClosing, DisconnectOp::Handshake);
                    self.conn_index.remove(&id);
                    self.undead.push(conn);
                    return;
                }
                torrent.peers.insert(id, conn);
            } else {
                self.conn_index.remove(&id);
                self.undead.push(conn);
                return;
            }
        }

        self.after_handshake(id, claimed, now);
    }

    /// Post-handshake pleasantries: bitfield, extended handshake, DHT
    /// port.
    fn after_handshake(&mut self, id: ConnId, hash: InfoHash, now: Instant) {
        let advertised_port = self.advertised_port();
        let reqq = self.settings.max_allowed_in_request_queue;
        let dht_enabled = self.dht.is_some();
        let Some(torrent) = self.torrents.get_mut(&hash) else {
            return;
        };
        let have = torrent.picker.as_ref().map(|p| p.have().clone());
        let Some(conn) = torrent.peers.get_mut(&id) else {
            return;
        };

        if conn.supports_extensions {
            let ext = ExtensionHandshake::ours(advertised_port, conn.addr.ip(), reqq);
            conn.send(
                &Message::Extended {
                    id: crate::constants::EXTENSION_HANDSHAKE_ID,
                    payload: ext.encode(),
                },
                now,
            );
        }
        match have {
            Some(have) if have.is_full() && conn.supports_fast => {
                conn.send(&Message::HaveAll, now);
            }
            Some(have) if have.is_empty() && conn.supports_fast => {
                conn.send(&Message::HaveNone, now);
            }
            Some(have) => {
                conn.send(&Message::Bitfield(have.to_wire()), now);
            }
            None => {}
        }
        if conn.supports_dht && dht_enabled {
            conn.send(&Message::DhtPort(advertised_port), now);
        }

        self.alerts.post(Alert::PeerConnected {
            info_hash: hash,
            addr: torrent.peers[&id].addr,
        });
        self.refresh_lists(hash);
    }

    fn on_message(&mut self, id: ConnId, msg: Message) {
        let now = self.clock.now();
        let Some(Some(hash)) = self.conn_index.get(&id).copied() else {
            // message on a pending connection before its handshake
            self.disconnect_conn(
                id,
                PeerError::InvalidMessage("message before handshake"),
                DisconnectOp::Handshake,
            );
            return;
        };

        let incoming = {
            let Some(torrent) = self.torrents.get_mut(&hash) else {
                return;
            };
            let Some(conn) = torrent.peers.get_mut(&id) else {
                return;
            };
            match conn.handle_message(msg, now) {
                Ok(incoming) => incoming,
                Err(e) => {
                    self.disconnect_conn(id, e, DisconnectOp::Read);
                    return;
                }
            }
        };

        match incoming {
            Incoming::None => {}
            Incoming::Have(piece) => self.on_peer_have(hash, id, piece),
            Incoming::Bitfield(bits) => self.on_peer_bitfield(hash, id, Some(bits)),
            Incoming::HaveAll => self.on_peer_bitfield(hash, id, None),
            Incoming::HaveNone => {
                let Some(torrent) = self.torrents.get_mut(&hash) else {
                    return;
                };
                let num_pieces = torrent.meta.as_ref().map(|m| m.num_pieces()).unwrap_or(0);
                if let Some(conn) = torrent.peers.get_mut(&id) {
                    conn.peer_bitfield = Some(Bitfield::new(num_pieces as usize));
                }
            }
            Incoming::Request(block) => self.on_peer_request(hash, id, block),
            Incoming::CancelUpload(_) => {}
            Incoming::Block { block, data } => self.on_peer_block(hash, id, block, data),
            Incoming::Rejected(block) => {
                if let Some(torrent) = self.torrents.get_mut(&hash) {
                    if let Some(picker) = &mut torrent.picker {
                        picker.request_lost(block, id);
                    }
                }
            }
            Incoming::ChokedUs { lost } => {
                if let Some(torrent) = self.torrents.get_mut(&hash) {
                    if let Some(picker) = &mut torrent.picker {
                        for block in lost {
                            picker.request_lost(block, id);
                        }
                    }
                }
            }
            Incoming::Unchoked => self.request_more(hash, id),
            Incoming::InterestChanged => {
                // the next unchoke round picks it up
            }
            Incoming::ExtendedHandshake => {}
            Incoming::DhtPort(port) => {
                let now = self.clock.now();
                let addr = self
                    .conn_mut(id)
                    .map(|c| SocketAddr::new(c.addr.ip(), port));
                if let (Some(dht), Some(addr)) = (&mut self.dht, addr) {
                    if port != 0 {
                        dht.add_node(addr, now);
                        self.flush_udp();
                    }
                }
            }
        }
    }

    fn on_peer_have(&mut self, hash: InfoHash, id: ConnId, piece: u32) {
        let now = self.clock.now();
        let Some(torrent) = self.torrents.get_mut(&hash) else {
            return;
        };
        let mut interesting = false;
        if let Some(picker) = &mut torrent.picker {
            picker.peer_has_piece(piece);
            if let Some(conn) = torrent.peers.get(&id) {
                if let Some(bf) = &conn.peer_bitfield {
                    interesting = picker.is_interesting(bf);
                }
            }
        }
        if let Some(conn) = torrent.peers.get_mut(&id) {
            if interesting && !conn.am_interested {
                conn.set_interested(true, now);
            }
        }
        self.request_more(hash, id);
    }

    /// `bits: None` means have-all.
    fn on_peer_bitfield(&mut self, hash: InfoHash, id: ConnId, bits: Option<Bytes>) {
        let now = self.clock.now();
        let Some(torrent) = self.torrents.get_mut(&hash) else {
            return;
        };
        let Some(num_pieces) = torrent.meta.as_ref().map(|m| m.num_pieces() as usize) else {
            // metadata-less torrent: remember nothing, the bitfield is
            // re-sent semantics are not available; drop the data
            return;
        };

        let bitfield = match bits {
            Some(bits) => match Bitfield::from_wire(&bits, num_pieces) {
                Some(bf) => bf,
                None => {
                    self.disconnect_conn(
                        id,
                        PeerError::InvalidMessage("bad bitfield length"),
                        DisconnectOp::Read,
                    );
                    return;
                }
            },
            None => Bitfield::full(num_pieces),
        };

        let mut interesting = false;
        if let Some(picker) = &mut torrent.picker {
            // replace any previous claim
            if let Some(conn) = torrent.peers.get(&id) {
                if let Some(old) = &conn.peer_bitfield {
                    picker.peer_left(old);
                }
            }
            picker.peer_joined(&bitfield);
            interesting = picker.is_interesting(&bitfield);
        }
        if let Some(conn) = torrent.peers.get_mut(&id) {
            conn.peer_bitfield = Some(bitfield);
            if interesting {
                conn.set_interested(true, now);
            }
        }
        self.request_more(hash, id);
    }

    fn on_peer_request(&mut self, hash: InfoHash, id: ConnId, block: BlockRef) {
        let Some(torrent) = self.torrents.get(&hash) else {
            return;
        };
        let Some(meta) = &torrent.meta else {
            return;
        };
        if !meta.request_in_range(block.piece, block.offset, block.length) {
            self.disconnect_conn(id, PeerError::RequestOutOfRange, DisconnectOp::Read);
            return;
        }
        // only serve verified pieces
        let have = torrent
            .picker
            .as_ref()
            .map(|p| p.have().has(block.piece as usize))
            .unwrap_or(false);
        if !have {
            return;
        }
        self.serve_block(hash, id, block);
    }

    fn serve_block(&mut self, hash: InfoHash, id: ConnId, block: BlockRef) {
        // backpressure: a peer over its send-buffer watermark waits for
        // the per-tick drain
        if let Some(conn) = self.conn_mut(id) {
            if conn.send_buffer_full() {
                return;
            }
        }
        let disk_tx = self.disk_tx.clone();
        let (tx, rx) = oneshot::channel();
        self.disk
            .read_block(hash, block.piece, block.offset, block.length, tx);
        tokio::spawn(async move {
            if let Ok(result) = rx.await {
                let _ = disk_tx.send(DiskEvent::ReadDone {
                    conn: id,
                    info_hash: hash,
                    block,
                    result,
                });
            }
        });
    }

    fn on_peer_block(&mut self, hash: InfoHash, id: ConnId, block: BlockRef, data: Bytes) {
        let now = self.clock.now();
        let result = {
            let Some(torrent) = self.torrents.get_mut(&hash) else {
                return;
            };
            torrent.on_block(block, data, id)
        };

        match result {
            BlockResult::Progress | BlockResult::Ignored => {}
            BlockResult::PieceComplete {
                piece,
                data,
                duplicates,
                torrent_finished,
            } => {
                // cancel end-game duplicates on their connections
                if let Some(torrent) = self.torrents.get_mut(&hash) {
                    let dup_block = BlockRef {
                        piece: block.piece,
                        offset: block.offset,
                        length: block.length,
                    };
                    for dup in duplicates {
                        if let Some(conn) = torrent.peers.get_mut(&dup) {
                            conn.cancel_request(dup_block, now);
                        }
                    }
                    torrent.broadcast_have(piece, now);
                }

                // persist asynchronously
                let disk_tx = self.disk_tx.clone();
                let (tx, rx) = oneshot::channel();
                self.disk.write_piece(hash, piece, data, tx);
                tokio::spawn(async move {
                    if let Ok(result) = rx.await {
                        let _ = disk_tx.send(DiskEvent::WriteDone {
                            info_hash: hash,
                            piece,
                            result,
                        });
                    }
                });

                self.alerts.post(Alert::PieceFinished {
                    info_hash: hash,
                    piece,
                });
                if torrent_finished {
                    self.on_torrent_finished(hash);
                }
            }
            BlockResult::HashFailed { piece } => {
                self.alerts.post(Alert::HashFailed {
                    info_hash: hash,
                    piece,
                });
                // trust bookkeeping on the delivering peer
                let failed = self
                    .torrents
                    .get_mut(&hash)
                    .and_then(|t| t.peers.get_mut(&id))
                    .map(|conn| conn.on_hashfail().is_err())
                    .unwrap_or(false);
                if failed {
                    self.disconnect_conn(id, PeerError::HashFailures, DisconnectOp::Read);
                }
            }
        }

        self.request_more(hash, id);
    }

    fn on_torrent_finished(&mut self, hash: InfoHash) {
        let session_time = self.clock.session_time();
        if let Some(torrent) = self.torrents.get_mut(&hash) {
            torrent.seeding_since = Some(session_time);
            torrent.state_dirty = true;
            // leaving the download queue compacts positions behind it
            let old_pos = torrent.queue_pos;
            torrent.queue_pos = -1;
            if old_pos >= 0 {
                for other in self.torrents.values_mut() {
                    if other.queue_pos > old_pos {
                        other.queue_pos -= 1;
                    }
                }
                self.max_queue_pos -= 1;
            }
        }
        // final announce with the completed event
        self.announce_torrent(hash, TrackerEvent::Completed);
        self.alerts.post(Alert::TorrentFinished { info_hash: hash });
        self.refresh_lists(hash);
    }

    /// Fills a peer's request pipeline from the picker.
    fn request_more(&mut self, hash: InfoHash, id: ConnId) {
        let now = self.clock.now();
        let Some(torrent) = self.torrents.get_mut(&hash) else {
            return;
        };
        if torrent.paused || torrent.graceful_pause || torrent.has_error() {
            return;
        }
        let Some(picker) = &mut torrent.picker else {
            return;
        };
        let Some(conn) = torrent.peers.get_mut(&id) else {
            return;
        };
        if !conn.is_active() {
            return;
        }
        let want = conn.request_slots();
        if want == 0 {
            return;
        }
        let Some(bitfield) = conn.peer_bitfield.clone() else {
            return;
        };
        let blocks = picker.pick(&bitfield, want, id);
        for block in blocks {
            conn.push_request(block, now);
        }
    }

    // ------------------------------------------------------------------
    // disconnect path
    // ------------------------------------------------------------------

    /// The engine-side single disconnect entry point: routes the error
    /// through the connection, releases picker claims, detaches from
    /// torrent and session, parks the connection until its pump exits.
    fn disconnect_conn(&mut self, id: ConnId, error: PeerError, op: DisconnectOp) {
        let Some(owner) = self.conn_index.remove(&id) else {
            return;
        };

        let mut conn = match owner {
            Some(hash) => {
                let Some(torrent) = self.torrents.get_mut(&hash) else {
                    return;
                };
                let Some(mut conn) = torrent.peers.remove(&id) else {
                    return;
                };
                // release availability and in-flight claims
                if let Some(picker) = &mut torrent.picker {
                    if let Some(bf) = &conn.peer_bitfield {
                        picker.peer_left(bf);
                    }
                    picker.connection_lost(id);
                }
                torrent.recycle_candidate(conn.addr);
                if !conn.am_choking && !self.classes.ignores_unchoke_slots(&conn.classes) {
                    self.num_unchoked = self.num_unchoked.saturating_sub(1);
                }
                let protocol_violation = error.is_protocol_violation();
                self.alerts.post(Alert::PeerDisconnected {
                    info_hash: Some(hash),
                    addr: conn.addr,
                    message: error.to_string(),
                    protocol_violation,
                });
                conn.start_disconnect(error, op);
                self.refresh_lists(hash);
                conn
            }
            None => {
                let Some(mut conn) = self.pending.remove(&id) else {
                    return;
                };
                self.alerts.post(Alert::PeerDisconnected {
                    info_hash: None,
                    addr: conn.addr,
                    message: error.to_string(),
                    protocol_violation: error.is_protocol_violation(),
                });
                conn.start_disconnect(error, op);
                conn
            }
        };

        for class in conn.classes.clone() {
            self.classes.decref(class);
        }
        if conn.pump_finished() {
            return; // uniquely held, drop now
        }
        conn.optimistically_unchoked = false;
        self.undead.push(conn);
    }

    // ------------------------------------------------------------------
    // UDP demux
    // ------------------------------------------------------------------

    fn on_udp(&mut self, data: Vec<u8>, source: SocketAddr) {
        let now = self.clock.now();
        if data.first() == Some(&b'd') {
            // bencoded dict: DHT
            let events = match &mut self.dht {
                Some(dht) => dht.incoming_packet(&data, source, now),
                None => Vec::new(),
            };
            self.on_dht_events(events);
            self.flush_udp();
        } else if utp::looks_like_utp(&data) {
            if let Some((reader, writer)) = self.utp.incoming_packet(&data, source, now) {
                self.on_incoming_utp(reader, writer, source);
            }
            self.flush_udp();
        } else {
            // remaining option: a UDP tracker response
            self.tracker_router.dispatch(source, &data);
        }
    }

    fn on_incoming_utp(
        &mut self,
        reader: crate::utp::UtpReader,
        writer: crate::utp::UtpWriter,
        addr: SocketAddr,
    ) {
        if self.aborting || self.session_paused {
            return;
        }
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        let (limits, class_set) = self.build_limits(addr, SocketKind::Utp);
        let pump = spawn_incoming(
            id,
            PeerStream::Utp(reader, writer),
            limits,
            self.peer_tx.clone(),
        );
        let now = self.clock.now();
        let conn = PeerConnection::new(
            id,
            addr,
            SocketKind::Utp,
            false,
            None,
            class_set.clone(),
            self.settings.max_allowed_in_request_queue,
            self.settings.max_requests_per_tick,
            self.settings.max_out_request_queue,
            pump,
            now,
        );
        for class in class_set {
            self.classes.incref(class);
        }
        self.pending.insert(id, conn);
        self.conn_index.insert(id, None);
    }

    fn on_dht_events(&mut self, events: Vec<DhtEvent>) {
        for event in events {
            match event {
                DhtEvent::PeersFound { info_hash, peers } => {
                    if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                        torrent.add_candidates(peers);
                    }
                    self.refresh_lists(info_hash);
                }
                DhtEvent::Bootstrapped { nodes } => {
                    self.alerts.post(Alert::DhtBootstrapped { nodes });
                }
            }
        }
    }

    fn on_lsd_peer(&mut self, peer: LsdPeer) {
        if let Some(torrent) = self.torrents.get_mut(&peer.info_hash) {
            torrent.add_candidates([peer.addr]);
            self.alerts.post(Alert::LsdPeerFound {
                info_hash: peer.info_hash,
            });
            self.refresh_lists(peer.info_hash);
        }
    }

    // ------------------------------------------------------------------
    // disk events
    // ------------------------------------------------------------------

    fn on_disk_event(&mut self, event: DiskEvent) {
        let now = self.clock.now();
        match event {
            DiskEvent::WriteDone {
                info_hash,
                piece,
                result,
            } => {
                if let Err(e) = result {
                    warn!(torrent = %info_hash, piece, error = %e, "piece write failed");
                    if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                        torrent.set_error(e.to_string());
                    }
                    self.alerts.post(Alert::TorrentError {
                        info_hash,
                        message: e.to_string(),
                    });
                    self.refresh_lists(info_hash);
                }
            }
            DiskEvent::ReadDone {
                conn,
                info_hash,
                block,
                result,
            } => match result {
                Ok(data) => {
                    if let Some(peer) = self
                        .torrents
                        .get_mut(&info_hash)
                        .and_then(|t| t.peers.get_mut(&conn))
                    {
                        // the request may have been cancelled meanwhile
                        if let Some(pos) =
                            peer.upload_queue.iter().position(|b| *b == block)
                        {
                            peer.upload_queue.remove(pos);
                            peer.send(
                                &Message::Piece {
                                    index: block.piece,
                                    begin: block.offset,
                                    data,
                                },
                                now,
                            );
                        }
                    }
                    if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                        torrent.total_uploaded += block.length as u64;
                        torrent.payload_since_start += block.length as u64;
                    }
                }
                Err(e) => {
                    warn!(torrent = %info_hash, error = %e, "block read failed");
                    if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                        torrent.set_error(e.to_string());
                    }
                    self.refresh_lists(info_hash);
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // trackers
    // ------------------------------------------------------------------

    fn announce_torrent(&mut self, hash: InfoHash, event: TrackerEvent) {
        let now = self.clock.now();
        let Some(torrent) = self.torrents.get(&hash) else {
            return;
        };
        if !torrent.announce_to_trackers && event == TrackerEvent::Empty {
            return;
        }
        let Some(entry) = torrent.trackers.next_due(now) else {
            return;
        };
        let url = entry.url.clone();
        if self.announcing.contains(&(hash, url.clone())) {
            return;
        }
        let (uploaded, downloaded, left) = {
            let left = torrent
                .picker
                .as_ref()
                .zip(torrent.meta.as_ref())
                .map(|(p, m)| {
                    let missing = m.num_pieces() as usize - p.num_have();
                    missing as u64 * m.piece_length as u64
                })
                .unwrap_or(0);
            (torrent.total_uploaded, torrent.total_downloaded, left)
        };
        self.announcing.insert((hash, url.clone()));
        self.spawn_announce(hash, url, event, uploaded, downloaded, left);
    }

    fn spawn_announce(
        &self,
        hash: InfoHash,
        url: String,
        event: TrackerEvent,
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) {
        let request = AnnounceRequest {
            info_hash: hash,
            peer_id: self.peer_id.0,
            port: self.advertised_port(),
            uploaded,
            downloaded,
            left,
            event,
            key: self.tracker_key,
            num_want: crate::constants::DEFAULT_NUM_WANT,
        };
        let tracker_tx = self.tracker_tx.clone();
        let udp_socket = self.udp_socket();
        let router = Arc::clone(&self.tracker_router);

        tokio::spawn(async move {
            let result = if url.starts_with("udp://") {
                match udp_socket {
                    Some(socket) => match UdpTracker::new(&url, socket, router).await {
                        Ok(mut tracker) => tracker.announce(&request).await,
                        Err(e) => Err(e),
                    },
                    None => Err(TrackerError::InvalidUrl(url.clone())),
                }
            } else {
                match HttpTracker::new(&url) {
                    Ok(tracker) => tracker.announce(&request).await,
                    Err(e) => Err(e),
                }
            };
            let _ = tracker_tx.send(TrackerOutcome {
                info_hash: hash,
                url,
                event,
                result,
            });
        });
    }

    fn on_tracker_outcome(&mut self, outcome: TrackerOutcome) {
        let now = self.clock.now();
        self.announcing.remove(&(outcome.info_hash, outcome.url.clone()));
        let Some(torrent) = self.torrents.get_mut(&outcome.info_hash) else {
            return;
        };
        match outcome.result {
            Ok(response) => {
                torrent.trackers.on_announce_ok(
                    &outcome.url,
                    response.interval,
                    response.min_interval,
                    now,
                );
                let num_peers = response.peers.len();
                torrent.add_candidates(response.peers.iter().copied());
                self.alerts.post(Alert::TrackerAnnounceOk {
                    info_hash: outcome.info_hash,
                    url: outcome.url,
                    num_peers,
                });
                // boost: freshly announced torrents connect first
                if num_peers > 0 && outcome.event != TrackerEvent::Stopped {
                    self.pump.prioritize(outcome.info_hash, num_peers.min(10));
                }
            }
            Err(e) => {
                torrent.trackers.on_announce_failed(&outcome.url, now);
                self.alerts.post(Alert::TrackerError {
                    info_hash: outcome.info_hash,
                    url: outcome.url,
                    message: e.to_string(),
                });
            }
        }
        self.refresh_lists(outcome.info_hash);
    }

    /// Scrapes UDP trackers of paused auto-managed torrents so the
    /// auto-manager can rank them by swarm demand.
    fn scrape_paused_torrents(&mut self) {
        let hashes: Vec<InfoHash> = self.lists.list(ListKind::WantScrape).to_vec();
        for hash in hashes {
            let Some(url) = self.torrents.get(&hash).and_then(|t| {
                t.trackers
                    .entries()
                    .iter()
                    .find(|e| e.url.starts_with("udp://"))
                    .map(|e| e.url.clone())
            }) else {
                continue;
            };
            let Some(socket) = self.udp_socket() else {
                return;
            };
            let router = Arc::clone(&self.tracker_router);
            let scrape_tx = self.scrape_tx.clone();
            tokio::spawn(async move {
                let result = match UdpTracker::new(&url, socket, router).await {
                    Ok(mut tracker) => tracker.scrape(&hash).await,
                    Err(e) => Err(e),
                };
                let _ = scrape_tx.send(ScrapeOutcome {
                    info_hash: hash,
                    result,
                });
            });
        }
    }

    fn on_scrape_outcome(&mut self, outcome: ScrapeOutcome) {
        if let Ok(scrape) = outcome.result {
            if let Some(torrent) = self.torrents.get_mut(&outcome.info_hash) {
                torrent.on_scrape(scrape.complete, scrape.incomplete);
            }
        }
    }

    // ------------------------------------------------------------------
    // the tick
    // ------------------------------------------------------------------

    fn on_tick(&mut self) {
        let now = self.clock.tick();
        self.tick_count += 1;

        self.utp.tick(now);
        if let Some(dht) = &mut self.dht {
            let events = dht.tick(now);
            self.on_dht_events(events);
        }
        self.flush_udp();

        self.reap_undead();
        self.tick_connections(now);

        if self.session_paused || self.aborting {
            return;
        }

        // rate sampling feeds the chokers
        self.sample_rates(now);

        if self.tick_count % self.settings.unchoke_interval.max(1) == 0 {
            self.recalculate_unchoke_slots(now);
        }
        if self.tick_count % self.settings.optimistic_unchoke_interval.max(1) == 0 {
            self.recalculate_optimistic_unchokes(now);
        }
        if self.tick_count % self.settings.auto_manage_interval.max(1) == 0 {
            // scrape first so the seed ranks the scheduler reads are as
            // fresh as the last round allows
            self.scrape_paused_torrents();
            self.run_auto_manage();
        }

        self.announce_due_trackers();
        self.dht_announce_tick(now);
        self.lsd_announce_tick();
        self.run_connect_pump();
        self.serve_delayed_uploads();
        self.post_dirty_state_updates();

        #[cfg(debug_assertions)]
        self.check_invariants();
    }

    fn reap_undead(&mut self) {
        self.undead.retain(|conn| !conn.pump_finished());
    }

    /// Per-connection timers: keep-alives, handshake and inactivity
    /// timeouts, request timeout sweeps.
    fn tick_connections(&mut self, now: Instant) {
        let ids: Vec<ConnId> = self.conn_index.keys().copied().collect();
        for id in ids {
            let Some(owner) = self.conn_index.get(&id).copied() else {
                continue;
            };
            let action = match self.conn_mut(id) {
                Some(conn) => conn.tick(now),
                None => continue,
            };
            match action {
                TickAction::None => {}
                TickAction::SendKeepAlive => {
                    if let Some(conn) = self.conn_mut(id) {
                        conn.send(&Message::KeepAlive, now);
                    }
                }
                TickAction::Timeout => {
                    self.disconnect_conn(id, PeerError::Timeout, DisconnectOp::Tick);
                    continue;
                }
            }

            // sweep request timeouts and hand the blocks back
            if let Some(hash) = owner {
                let lost = self
                    .torrents
                    .get_mut(&hash)
                    .and_then(|t| t.peers.get_mut(&id))
                    .map(|c| c.sweep_request_timeouts(now))
                    .unwrap_or_default();
                if !lost.is_empty() {
                    if let Some(torrent) = self.torrents.get_mut(&hash) {
                        if let Some(picker) = &mut torrent.picker {
                            for block in &lost {
                                picker.request_lost(*block, id);
                            }
                        }
                    }
                    self.request_more(hash, id);
                }
            }
        }
    }

    fn sample_rates(&mut self, _now: Instant) {
        for torrent in self.torrents.values_mut() {
            for conn in torrent.peers.values_mut() {
                conn.stats.sample_rates(Duration::from_secs(1));
            }
        }
    }

    fn unchoke_candidates(&self) -> Vec<UnchokeCandidate> {
        let mut candidates = Vec::new();
        for torrent in self.torrents.values() {
            let seeding = torrent.is_finished();
            for conn in torrent.peers.values() {
                candidates.push(UnchokeCandidate {
                    conn: conn.id,
                    interested: conn.peer_interested,
                    choked: conn.am_choking,
                    connecting: conn.is_connecting(),
                    disconnecting: conn.is_disconnecting(),
                    torrent_paused: torrent.paused,
                    ignore_unchoke_slots: self.classes.ignores_unchoke_slots(&conn.classes),
                    optimistically_unchoked: conn.optimistically_unchoked,
                    last_optimistic_unchoke: conn.last_optimistic_unchoke,
                    rank_rate: if seeding {
                        conn.stats.uploaded_in_round()
                    } else {
                        conn.stats.downloaded_in_round()
                    },
                    uploaded_in_round: conn.stats.uploaded_in_round(),
                    est_reciprocation_rate: conn.est_reciprocation_rate,
                });
            }
        }
        candidates
    }

    fn recalculate_unchoke_slots(&mut self, now: Instant) {
        let candidates = self.unchoke_candidates();
        let decisions = recalculate_unchoke_slots(
            &candidates,
            &self.settings,
            self.settings.upload_rate_limit,
            self.settings.unchoke_interval * 1000,
        );
        self.allowed_upload_slots = decisions.allowed_upload_slots;

        for id in decisions.clear_optimistic {
            if let Some(conn) = self.conn_mut(id) {
                conn.optimistically_unchoked = false;
            }
        }
        for id in decisions.unchoke {
            if let Some(conn) = self.conn_mut(id) {
                if conn.unchoke(now) {
                    self.num_unchoked += 1;
                }
            }
        }
        for id in decisions.choke {
            if let Some(conn) = self.conn_mut(id) {
                if conn.choke(now) {
                    self.num_unchoked = self.num_unchoked.saturating_sub(1);
                }
            }
        }

        // round boundary for the rate counters
        for torrent in self.torrents.values_mut() {
            for conn in torrent.peers.values_mut() {
                conn.stats.reset_round();
            }
        }
    }

    fn recalculate_optimistic_unchokes(&mut self, now: Instant) {
        let candidates = self.unchoke_candidates();
        let decisions = recalculate_optimistic_unchoke_slots(&candidates, &self.settings);
        let session_time = self.clock.session_time();

        for id in decisions.grant {
            if let Some(conn) = self.conn_mut(id) {
                conn.optimistically_unchoked = true;
                conn.last_optimistic_unchoke = session_time;
                if conn.unchoke(now) {
                    self.num_unchoked += 1;
                }
            }
        }
        for id in decisions.revoke {
            if let Some(conn) = self.conn_mut(id) {
                conn.optimistically_unchoked = false;
                if conn.choke(now) {
                    self.num_unchoked = self.num_unchoked.saturating_sub(1);
                }
            }
        }
    }

    fn run_auto_manage(&mut self) {
        let session_time = self.clock.session_time();
        let grace = self.settings.auto_manage_startup;
        let entries: Vec<AutoManageEntry> = self
            .torrents
            .values()
            .map(|t| AutoManageEntry {
                hash: t.info_hash,
                auto_managed: t.auto_managed,
                paused: t.paused,
                checking: t.is_checking(),
                finished: t.is_finished(),
                has_error: t.has_error(),
                queue_pos: t.queue_pos,
                seed_rank: t.seed_rank(session_time),
                activity: t.activity(session_time, grace),
            })
            .collect();
        let decisions = recalculate_auto_managed_torrents(&entries, &self.settings);

        for (hash, dht, tracker, lsd) in decisions.announce {
            if let Some(torrent) = self.torrents.get_mut(&hash) {
                torrent.announce_to_dht = dht;
                torrent.announce_to_trackers = tracker;
                torrent.announce_to_lsd = lsd;
            }
        }
        let now = self.clock.now();
        for hash in decisions.pause {
            if let Some(torrent) = self.torrents.get_mut(&hash) {
                if !torrent.paused {
                    torrent.pause(true, now);
                    torrent.allow_peers = false;
                }
            }
            self.refresh_lists(hash);
        }
        for hash in decisions.resume {
            if let Some(torrent) = self.torrents.get_mut(&hash) {
                torrent.allow_peers = true;
                if torrent.paused {
                    torrent.resume(session_time);
                }
            }
            self.refresh_lists(hash);
        }
    }

    fn run_connect_pump(&mut self) {
        if self.aborting {
            return;
        }
        let want_download = self.lists.list(ListKind::WantPeersDownload).to_vec();
        let want_finished = self.lists.list(ListKind::WantPeersFinished).to_vec();
        let ctx = PumpContext {
            want_download: &want_download,
            want_finished: &want_finished,
            connection_speed: self.settings.connection_speed,
            connections_limit: self.settings.connections_limit,
            num_connections: self.num_connections(),
            free_slots: self.gate.free_slots(),
            connect_seed_every_n: self.settings.connect_seed_every_n,
        };

        // split-borrow dance: the pump cursor state is separate from
        // the torrent/connection state the closure mutates
        let mut pump = std::mem::take(&mut self.pump);
        let outcome = pump.run(&ctx, |hash| self.try_connect_peer(hash));
        self.pump = pump;

        if outcome.clamp_connections_limit {
            let clamped = self.num_connections().max(2);
            warn!(clamped, "lowering connection limit after resource exhaustion");
            self.settings.connections_limit = clamped;
        }
        for hash in want_download.iter().chain(want_finished.iter()) {
            self.refresh_lists(*hash);
        }
    }

    /// Dials one candidate of `hash`, honoring the class connection
    /// factor, the per-torrent cap and the half-open gate.
    fn try_connect_peer(&mut self, hash: InfoHash) -> AttemptOutcome {
        let now = self.clock.now();
        let Some(torrent) = self.torrents.get_mut(&hash) else {
            return AttemptOutcome::NoCandidate;
        };
        if torrent.peers.len() >= torrent.max_connections || !torrent.allow_peers {
            return AttemptOutcome::NoCandidate;
        }
        let Some(addr) = torrent.next_candidate() else {
            return AttemptOutcome::NoCandidate;
        };

        let kind = if self.settings.prefer_utp {
            SocketKind::Utp
        } else {
            SocketKind::Tcp
        };
        let (limits, class_set) = self.build_limits(addr, kind);

        // per-class connection limit factor shrinks the global limit
        let factor = self.classes.connection_limit_factor(&class_set) as usize;
        let class_limit = self.settings.connections_limit * factor / 100;
        if self.num_connections() >= class_limit {
            return AttemptOutcome::NoCandidate;
        }

        let Some(ticket) = self.gate.try_enter() else {
            return AttemptOutcome::NoCandidate;
        };

        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        let handshake = Handshake::new(hash.0, self.peer_id.0);
        let pump = match kind {
            SocketKind::Utp => {
                // the transport connects underneath; the connect slot is
                // returned right away
                drop(ticket);
                let (reader, writer) = self.utp.connect(addr, now);
                self.flush_udp();
                spawn_outgoing_stream(
                    id,
                    PeerStream::Utp(reader, writer),
                    handshake.encode(),
                    limits,
                    self.peer_tx.clone(),
                )
            }
            _ => spawn_outgoing(
                id,
                addr,
                handshake.encode(),
                limits,
                self.peer_tx.clone(),
                Some(ticket),
            ),
        };
        let conn = PeerConnection::new(
            id,
            addr,
            kind,
            true,
            Some(hash),
            class_set.clone(),
            self.settings.max_allowed_in_request_queue,
            self.settings.max_requests_per_tick,
            self.settings.max_out_request_queue,
            pump,
            now,
        );
        for class in class_set {
            self.classes.incref(class);
        }
        let torrent = self.torrents.get_mut(&hash).expect("torrent present");
        torrent.peers.insert(id, conn);
        self.conn_index.insert(id, Some(hash));
        AttemptOutcome::Connected
    }

    fn announce_due_trackers(&mut self) {
        let hashes: Vec<InfoHash> = self.torrents.keys().copied().collect();
        for hash in hashes {
            let wants = self
                .torrents
                .get(&hash)
                .map(|t| {
                    !t.paused
                        && !t.has_error()
                        && t.announce_to_trackers
                        && !t.trackers.is_empty()
                })
                .unwrap_or(false);
            if !wants {
                continue;
            }
            let event = {
                let torrent = self.torrents.get(&hash).expect("listed");
                let started = torrent
                    .trackers
                    .next_due(self.clock.now())
                    .map(|e| !e.started)
                    .unwrap_or(false);
                if started {
                    TrackerEvent::Started
                } else {
                    TrackerEvent::Empty
                }
            };
            self.announce_torrent(hash, event);
        }
    }

    /// One torrent per round gets a DHT announce, spreading the
    /// interval across the swarm.
    fn dht_announce_tick(&mut self, now: Instant) {
        let Some(dht) = &mut self.dht else {
            return;
        };
        let candidates: Vec<InfoHash> = self
            .torrents
            .values()
            .filter(|t| !t.paused && !t.has_error() && t.announce_to_dht)
            .map(|t| t.info_hash)
            .collect();
        if candidates.is_empty() {
            return;
        }
        let slice = (self.settings.dht_announce_interval / candidates.len() as u64).max(1);
        if self.tick_count % slice != 0 {
            return;
        }
        self.dht_announce_cursor = (self.dht_announce_cursor + 1) % candidates.len();
        let hash = candidates[self.dht_announce_cursor];
        let port = self.listen_sockets.first().map(|s| s.advertised_port());
        dht.announce(hash, port, now);
        self.flush_udp();
    }

    fn lsd_announce_tick(&mut self) {
        let Some(lsd) = self.lsd.clone() else {
            return;
        };
        let candidates: Vec<InfoHash> = self
            .torrents
            .values()
            .filter(|t| !t.paused && !t.has_error() && t.announce_to_lsd)
            .map(|t| t.info_hash)
            .collect();
        if candidates.is_empty() {
            return;
        }
        let slice = (self.settings.lsd_announce_interval / candidates.len() as u64).max(1);
        if self.tick_count % slice != 0 {
            return;
        }
        self.lsd_announce_cursor = (self.lsd_announce_cursor + 1) % candidates.len();
        let hash = candidates[self.lsd_announce_cursor];
        let port = self.advertised_port();
        tokio::spawn(async move {
            lsd.announce(&hash, port).await;
        });
    }

    /// Retries upload reads that were postponed by the send-buffer
    /// watermark.
    fn serve_delayed_uploads(&mut self) {
        let mut to_serve: Vec<(InfoHash, ConnId, BlockRef)> = Vec::new();
        for (hash, torrent) in &self.torrents {
            for (id, conn) in &torrent.peers {
                if conn.is_active() && !conn.am_choking && !conn.send_buffer_full() {
                    for block in conn.upload_queue.iter().take(4) {
                        to_serve.push((*hash, *id, *block));
                    }
                }
            }
        }
        for (hash, id, block) in to_serve {
            self.serve_block(hash, id, block);
        }
    }

    fn post_dirty_state_updates(&mut self) {
        let dirty = self.lists.take_state_updates();
        if dirty.is_empty() {
            return;
        }
        let mut updates = Vec::with_capacity(dirty.len());
        for hash in dirty {
            if let Some(torrent) = self.torrents.get_mut(&hash) {
                torrent.state_dirty = false;
                // the take drained the list wholesale; clear the slot
                torrent.list_pos.clear(ListKind::StateUpdates);
                updates.push(status_of(torrent));
            }
        }
        if !updates.is_empty() {
            self.alerts.post(Alert::StateUpdate { updates });
        }
    }

    fn post_torrent_updates(&mut self) {
        let updates: Vec<TorrentStatus> =
            self.torrents.values().map(status_of).collect();
        self.alerts.post(Alert::StateUpdate { updates });
    }

    fn remap_ports(&mut self, port: u16) {
        if !self.portmap.has_mappers() {
            return;
        }
        let mut updates = Vec::new();
        updates.extend(self.portmap.remap(MapProtocol::Tcp, port));
        updates.extend(self.portmap.remap(MapProtocol::Udp, port));
        for update in updates {
            if let crate::portmap::PortMapUpdate::Succeeded {
                protocol: MapProtocol::Tcp,
                external_port,
                ..
            } = &update
            {
                if let Some(socket) = self.listen_sockets.first_mut() {
                    socket.external_port = Some(*external_port);
                }
            }
            self.alerts.post(Alert::PortMap(update));
        }
    }

    fn evict_loaded(&mut self, keep: Option<InfoHash>) {
        let evicted = self
            .lru
            .evict_down_to(self.settings.active_loaded_limit, keep);
        for hash in evicted {
            if let Some(torrent) = self.torrents.get_mut(&hash) {
                if torrent.pinned {
                    continue;
                }
                torrent.unload();
                self.refresh_lists(hash);
            }
        }
    }

    /// Bumps a torrent in the LRU on access; reloading evicted metadata
    /// is the caller's job (it comes from outside the engine).
    fn touch_torrent(&mut self, hash: InfoHash) {
        let eligible = self
            .torrents
            .get(&hash)
            .map(|t| t.is_loaded() && !t.pinned)
            .unwrap_or(false);
        if !eligible {
            return;
        }
        self.lru.bump(hash);
        self.evict_loaded(Some(hash));
    }

    // ------------------------------------------------------------------
    // invariants
    // ------------------------------------------------------------------

    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        // I1: every attached connection is owned by exactly the torrent
        // the index names
        for (id, owner) in &self.conn_index {
            match owner {
                Some(hash) => {
                    let owned = self
                        .torrents
                        .get(hash)
                        .map(|t| t.peers.contains_key(id))
                        .unwrap_or(false);
                    debug_assert!(owned, "conn {:?} not owned by {:?}", id, hash);
                }
                None => {
                    debug_assert!(self.pending.contains_key(id));
                }
            }
        }
        // I4: unchoke accounting matches reality
        let actual = self
            .torrents
            .values()
            .flat_map(|t| t.peers.values())
            .filter(|c| {
                c.is_active()
                    && !c.am_choking
                    && !self.classes.ignores_unchoke_slots(&c.classes)
            })
            .count();
        debug_assert_eq!(actual, self.num_unchoked, "unchoke count drifted");
        // I6: max_queue_pos is the maximum queue position
        let observed = self
            .torrents
            .values()
            .map(|t| t.queue_pos)
            .max()
            .unwrap_or(-1);
        debug_assert_eq!(observed, self.max_queue_pos, "queue position drifted");
    }
}

fn status_of(torrent: &Torrent) -> TorrentStatus {
    TorrentStatus {
        info_hash: torrent.info_hash,
        state: match torrent.state {
            TorrentState::CheckingFiles => "checking",
            TorrentState::DownloadingMetadata => "metadata",
            TorrentState::Downloading => "downloading",
            TorrentState::Seeding => "seeding",
            TorrentState::Error => "error",
        },
        paused: torrent.paused,
        num_peers: torrent.peers.len(),
        num_pieces: torrent
            .meta
            .as_ref()
            .map(|m| m.num_pieces() as usize)
            .unwrap_or(0),
        num_have: torrent.picker.as_ref().map(|p| p.num_have()).unwrap_or(0),
        total_downloaded: torrent.total_downloaded,
        total_uploaded: torrent.total_uploaded,
        queue_pos: torrent.queue_pos,
    }
}
