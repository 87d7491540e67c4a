//! The alert queue.
//!
//! The one structure written on the engine task and drained from user
//! threads, so it carries its own lock. The queue is bounded; when full,
//! new alerts are dropped and a counter records the loss.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::meta::InfoHash;
use crate::portmap::PortMapUpdate;

/// Everything the engine reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    TorrentAdded { info_hash: InfoHash },
    TorrentRemoved { info_hash: InfoHash },
    TorrentFinished { info_hash: InfoHash },
    TorrentPaused { info_hash: InfoHash },
    TorrentResumed { info_hash: InfoHash },
    TorrentError { info_hash: InfoHash, message: String },
    MetadataReceived { info_hash: InfoHash },

    PeerConnected { info_hash: InfoHash, addr: SocketAddr },
    PeerDisconnected {
        info_hash: Option<InfoHash>,
        addr: SocketAddr,
        message: String,
        /// True for protocol violations, false for transport errors.
        protocol_violation: bool,
    },
    /// A peer was dropped for flooding us with requests.
    PeerBanned { info_hash: InfoHash, addr: SocketAddr },

    PieceFinished { info_hash: InfoHash, piece: u32 },
    HashFailed { info_hash: InfoHash, piece: u32 },

    TrackerAnnounceOk {
        info_hash: InfoHash,
        url: String,
        num_peers: usize,
    },
    TrackerError {
        info_hash: InfoHash,
        url: String,
        message: String,
    },

    DhtBootstrapped { nodes: usize },
    LsdPeerFound { info_hash: InfoHash },

    ListenSucceeded { addr: SocketAddr },
    ListenFailed {
        device: String,
        port: u16,
        message: String,
    },
    PortMap(PortMapUpdate),

    /// Per-torrent status snapshot batch, answering
    /// `post_torrent_updates`.
    StateUpdate { updates: Vec<TorrentStatus> },

    /// Unusual conditions worth surfacing (performance warnings).
    Performance { message: String },
}

/// One torrent's status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentStatus {
    pub info_hash: InfoHash,
    pub state: &'static str,
    pub paused: bool,
    pub num_peers: usize,
    pub num_pieces: usize,
    pub num_have: usize,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
    pub queue_pos: i64,
}

struct AlertQueueInner {
    alerts: VecDeque<Alert>,
    dropped: u64,
    limit: usize,
}

/// Engine-written, user-drained alert channel.
pub struct AlertQueue {
    inner: Mutex<AlertQueueInner>,
    notify: Notify,
}

impl AlertQueue {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(AlertQueueInner {
                alerts: VecDeque::new(),
                dropped: 0,
                limit,
            }),
            notify: Notify::new(),
        })
    }

    /// Posts one alert; drops it if the queue is full.
    pub fn post(&self, alert: Alert) {
        {
            let mut inner = self.inner.lock();
            if inner.alerts.len() >= inner.limit {
                inner.dropped += 1;
                return;
            }
            inner.alerts.push_back(alert);
        }
        self.notify.notify_waiters();
    }

    /// Takes every queued alert.
    pub fn pop_all(&self) -> Vec<Alert> {
        self.inner.lock().alerts.drain(..).collect()
    }

    /// Blocks up to `timeout` for at least one alert, then drains.
    pub async fn wait(&self, timeout: Duration) -> Vec<Alert> {
        {
            let inner = self.inner.lock();
            if !inner.alerts.is_empty() {
                drop(inner);
                return self.pop_all();
            }
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        self.pop_all()
    }

    /// Alerts lost to the size cap since startup.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn set_limit(&self, limit: usize) {
        self.inner.lock().limit = limit;
    }
}
