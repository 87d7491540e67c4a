//! Session settings.
//!
//! A plain struct of tunables read by the schedulers. `apply_settings`
//! swaps the whole struct at a tick boundary, so one tick always sees
//! one consistent configuration.

use crate::constants::*;

/// Which unchoke scheduler ranks peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokerMode {
    /// Fixed slot count, ranked by recent transfer rate.
    FixedSlots,
    /// Like fixed-slots, but grows or shrinks the slot count in
    /// 1 KiB/s upload-rate steps.
    RateBased,
    /// Ranks by estimated download/upload reciprocation and fills an
    /// upload capacity budget.
    Bittyrant,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    // --- identity / listening ---
    /// (interface, port) pairs to listen on. An empty interface means
    /// all addresses; port 0 lets the OS choose.
    pub listen_interfaces: Vec<(String, u16)>,
    /// Additional bind attempts, incrementing the port each time.
    pub max_retry_port_bind: u32,
    /// Fall back to an OS-chosen port when the retries run out.
    pub allow_system_port_fallback: bool,
    /// Open an SSL acceptor next to each plain one.
    pub ssl_listen: bool,

    // --- connections ---
    pub connections_limit: usize,
    pub connections_slack: usize,
    pub max_connections_per_torrent: usize,
    pub half_open_limit: usize,
    /// Outbound connect attempts per tick.
    pub connection_speed: usize,
    /// Every n-th attempt goes to a finished torrent.
    pub connect_seed_every_n: usize,
    /// Prefer uTP over TCP for outgoing peers.
    pub prefer_utp: bool,

    // --- choking ---
    pub choker: ChokerMode,
    pub unchoke_slots: usize,
    pub unchoke_interval: u64,
    pub optimistic_unchoke_interval: u64,
    /// 0 derives `max(1, slots / 5)`.
    pub optimistic_unchoke_slots: usize,

    // --- rates ---
    pub upload_rate_limit: u64,
    pub download_rate_limit: u64,

    // --- auto-manage ---
    pub active_downloads: i32,
    pub active_seeds: i32,
    pub active_limit: i32,
    pub active_dht_limit: i32,
    pub active_tracker_limit: i32,
    pub active_lsd_limit: i32,
    pub auto_manage_interval: u64,
    pub auto_manage_startup: u64,
    pub auto_manage_prefer_seeds: bool,

    // --- eviction ---
    /// Torrents allowed to keep metadata loaded; 0 means unlimited.
    pub active_loaded_limit: usize,

    // --- peers ---
    pub max_allowed_in_request_queue: usize,
    pub max_requests_per_tick: usize,
    pub max_out_request_queue: usize,

    // --- discovery ---
    pub enable_dht: bool,
    pub enable_lsd: bool,
    pub dht_announce_interval: u64,
    pub lsd_announce_interval: u64,

    // --- alerts ---
    pub alert_queue_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            listen_interfaces: vec![(String::new(), 6881)],
            max_retry_port_bind: DEFAULT_MAX_RETRY_PORT_BIND,
            allow_system_port_fallback: true,
            ssl_listen: false,

            connections_limit: DEFAULT_CONNECTIONS_LIMIT,
            connections_slack: DEFAULT_CONNECTIONS_SLACK,
            max_connections_per_torrent: DEFAULT_MAX_CONNECTIONS_PER_TORRENT,
            half_open_limit: DEFAULT_HALF_OPEN_LIMIT,
            connection_speed: DEFAULT_CONNECTION_SPEED,
            connect_seed_every_n: DEFAULT_CONNECT_SEED_EVERY_N,
            prefer_utp: false,

            choker: ChokerMode::FixedSlots,
            unchoke_slots: DEFAULT_UNCHOKE_SLOTS,
            unchoke_interval: DEFAULT_UNCHOKE_INTERVAL,
            optimistic_unchoke_interval: DEFAULT_OPTIMISTIC_UNCHOKE_INTERVAL,
            optimistic_unchoke_slots: 0,

            upload_rate_limit: 0,
            download_rate_limit: 0,

            active_downloads: 3,
            active_seeds: 5,
            active_limit: 15,
            active_dht_limit: 88,
            active_tracker_limit: 1600,
            active_lsd_limit: 60,
            auto_manage_interval: DEFAULT_AUTO_MANAGE_INTERVAL,
            auto_manage_startup: DEFAULT_AUTO_MANAGE_STARTUP,
            auto_manage_prefer_seeds: false,

            active_loaded_limit: 0,

            max_allowed_in_request_queue: DEFAULT_MAX_ALLOWED_IN_REQUEST_QUEUE,
            max_requests_per_tick: DEFAULT_MAX_REQUESTS_PER_TICK,
            max_out_request_queue: DEFAULT_MAX_OUT_REQUEST_QUEUE,

            enable_dht: true,
            enable_lsd: true,
            dht_announce_interval: DEFAULT_DHT_ANNOUNCE_INTERVAL,
            lsd_announce_interval: DEFAULT_LSD_ANNOUNCE_INTERVAL,

            alert_queue_size: DEFAULT_ALERT_QUEUE_SIZE,
        }
    }
}

impl SessionSettings {
    /// The optimistic reserve: explicit setting or `max(1, slots / 5)`.
    pub fn effective_optimistic_slots(&self) -> usize {
        if self.optimistic_unchoke_slots > 0 {
            self.optimistic_unchoke_slots
        } else {
            (self.unchoke_slots / 5).max(1)
        }
    }
}
