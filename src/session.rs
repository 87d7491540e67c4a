//! The session: public handle, command surface, and the engine behind
//! them.
//!
//! All engine state is owned by a single task ([`engine::Engine::run`]);
//! the [`Session`] handle posts commands over a channel and reads
//! results from the alert queue. Dropping the handle shuts the engine
//! down.

pub mod alert;
pub mod auto_manage;
pub mod connect;
pub mod engine;
pub mod lists;
pub mod listen;
pub mod lru;
pub mod settings;
pub mod state;
pub mod unchoke;

#[cfg(test)]
mod tests;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::bandwidth::Channel;
use crate::classes::{ClassId, SocketKind};
use crate::meta::{InfoHash, TorrentMeta};
use crate::storage::DiskIo;
use crate::torrent::resume::ResumeData;
use alert::AlertQueue;
pub use settings::{ChokerMode, SessionSettings};

/// Parameters for `add_torrent`.
#[derive(Default)]
pub struct AddTorrentParams {
    /// Parsed metadata; absent for magnet adds.
    pub meta: Option<TorrentMeta>,
    /// Required when `meta` is absent.
    pub info_hash: Option<InfoHash>,
    /// (url, tier) announce list.
    pub trackers: Vec<(String, u8)>,
    pub paused: bool,
    pub auto_managed: bool,
    /// Pinned torrents are exempt from metadata eviction.
    pub pinned: bool,
    pub resume: Option<ResumeData>,
}

/// Commands posted from user threads onto the engine task.
pub enum Command {
    AddTorrent(Box<AddTorrentParams>),
    RemoveTorrent {
        info_hash: InfoHash,
        delete_files: bool,
    },
    PauseTorrent {
        info_hash: InfoHash,
        graceful: bool,
    },
    ResumeTorrent {
        info_hash: InfoHash,
    },
    PauseSession,
    ResumeSession,
    ApplySettings(Box<SessionSettings>),
    /// Rebind the listen sockets to new (interface, port) pairs.
    ListenOn(Vec<(String, u16)>),
    /// Register a NAT-PMP / UPnP implementation; the engine keeps one
    /// mapping per protocol on it from then on.
    AddPortMapper(Box<dyn crate::portmap::PortMapper>),
    /// Manually hand a peer address to a torrent.
    AddPeer {
        info_hash: InfoHash,
        addr: SocketAddr,
    },
    AddDhtNode(SocketAddr),
    /// Create a peer class; its id comes back on the reply channel.
    AddPeerClass {
        label: String,
        reply: oneshot::Sender<ClassId>,
    },
    SetPeerClassRate {
        class: ClassId,
        channel: Channel,
        rate: u64,
    },
    /// Assign a class to an inclusive remote-address range.
    AddIpFilterRule {
        first: IpAddr,
        last: IpAddr,
        class: ClassId,
    },
    /// Assign a class to a socket kind.
    AddTypeFilterRule {
        kind: SocketKind,
        class: ClassId,
    },
    SetQueuePosition {
        info_hash: InfoHash,
        position: i64,
    },
    PostTorrentUpdates,
    SaveState(oneshot::Sender<Vec<u8>>),
    LoadState(Vec<u8>),
    Shutdown,
}

/// The public handle. Cloneable; all clones drive the same engine.
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::UnboundedSender<Command>,
    alerts: Arc<AlertQueue>,
}

impl Session {
    /// Starts an engine with the given settings and disk backend.
    pub fn new(settings: SessionSettings, disk: Arc<dyn DiskIo>) -> Self {
        let alerts = AlertQueue::new(settings.alert_queue_size);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let engine_alerts = Arc::clone(&alerts);
        tokio::spawn(async move {
            engine::Engine::new(settings, disk, engine_alerts, cmd_rx)
                .run()
                .await;
        });
        Self { cmd_tx, alerts }
    }

    pub fn alerts(&self) -> Arc<AlertQueue> {
        Arc::clone(&self.alerts)
    }

    fn post(&self, cmd: Command) {
        let _ = self.cmd_tx.send(cmd);
    }

    pub fn add_torrent(&self, params: AddTorrentParams) {
        self.post(Command::AddTorrent(Box::new(params)));
    }

    pub fn remove_torrent(&self, info_hash: InfoHash, delete_files: bool) {
        self.post(Command::RemoveTorrent {
            info_hash,
            delete_files,
        });
    }

    pub fn pause_torrent(&self, info_hash: InfoHash, graceful: bool) {
        self.post(Command::PauseTorrent { info_hash, graceful });
    }

    pub fn resume_torrent(&self, info_hash: InfoHash) {
        self.post(Command::ResumeTorrent { info_hash });
    }

    pub fn pause(&self) {
        self.post(Command::PauseSession);
    }

    pub fn resume(&self) {
        self.post(Command::ResumeSession);
    }

    pub fn apply_settings(&self, settings: SessionSettings) {
        self.post(Command::ApplySettings(Box::new(settings)));
    }

    /// Rebinds the listen sockets; the old acceptors wind down and the
    /// new port is remapped and advertised.
    pub fn listen_on(&self, interfaces: Vec<(String, u16)>) {
        self.post(Command::ListenOn(interfaces));
    }

    pub fn add_port_mapper(&self, mapper: Box<dyn crate::portmap::PortMapper>) {
        self.post(Command::AddPortMapper(mapper));
    }

    /// Hands a known peer address to a torrent, ahead of discovery.
    pub fn add_peer(&self, info_hash: InfoHash, addr: SocketAddr) {
        self.post(Command::AddPeer { info_hash, addr });
    }

    pub fn add_dht_node(&self, addr: SocketAddr) {
        self.post(Command::AddDhtNode(addr));
    }

    /// Creates a rate-limit class; connections matching later filter
    /// rules will drain its buckets.
    pub async fn add_peer_class(&self, label: &str) -> Option<ClassId> {
        let (tx, rx) = oneshot::channel();
        self.post(Command::AddPeerClass {
            label: label.to_string(),
            reply: tx,
        });
        rx.await.ok()
    }

    pub fn set_peer_class_rate(&self, class: ClassId, channel: Channel, rate: u64) {
        self.post(Command::SetPeerClassRate {
            class,
            channel,
            rate,
        });
    }

    pub fn add_ip_filter_rule(&self, first: IpAddr, last: IpAddr, class: ClassId) {
        self.post(Command::AddIpFilterRule { first, last, class });
    }

    pub fn add_type_filter_rule(&self, kind: SocketKind, class: ClassId) {
        self.post(Command::AddTypeFilterRule { kind, class });
    }

    pub fn set_queue_position(&self, info_hash: InfoHash, position: i64) {
        self.post(Command::SetQueuePosition {
            info_hash,
            position,
        });
    }

    /// Requests a `StateUpdate` alert with per-torrent status.
    pub fn post_torrent_updates(&self) {
        self.post(Command::PostTorrentUpdates);
    }

    /// Snapshots the persistable session state.
    pub async fn save_state(&self) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.post(Command::SaveState(tx));
        rx.await.ok()
    }

    pub fn load_state(&self, data: Vec<u8>) {
        self.post(Command::LoadState(data));
    }

    /// Begins an orderly shutdown; the engine drains uTP sockets and
    /// exits.
    pub fn shutdown(&self) {
        self.post(Command::Shutdown);
    }
}
