//! Tracker clients (BEP-3 HTTP, BEP-15 UDP).
//!
//! Announces report our progress and fetch peer lists. HTTP trackers get
//! a GET with the standard query parameters; UDP trackers speak the
//! binary connect/announce/scrape protocol over the session's shared UDP
//! socket, demultiplexed by transaction id.
//!
//! Retry policy lives in the per-torrent tier state
//! ([`crate::torrent::trackers`]); a failed announce here fails once and
//! reports.

mod error;
mod http;
mod response;
mod udp;

pub use error::TrackerError;
pub use http::HttpTracker;
pub use response::{AnnounceResponse, ScrapeResponse, TrackerEvent};
pub use udp::{TrackerRouter, UdpTracker};

#[cfg(test)]
mod tests;

/// Everything an announce needs besides the tracker URL.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: crate::meta::InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    /// Random per-session key so the tracker can track us across IP
    /// changes.
    pub key: u32,
    pub num_want: i32,
}
