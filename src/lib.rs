//! ebb - a BitTorrent session engine
//!
//! The long-lived core of a BitTorrent client: a single-owner session
//! task orchestrating many torrents, each with many peer connections,
//! plus the discovery services (tracker, DHT, LSD) and the schedulers
//! (choking, auto-management, connection pumping, eviction) that tie
//! them together.
//!
//! # Modules
//!
//! - [`session`] - The engine, its settings, alerts and schedulers
//! - [`torrent`] - Torrent state, piece picker, tracker tiers, resume data
//! - [`peer`] - Peer wire protocol and the connection state machine
//! - [`dht`] - BEP-5 RPC manager and traversal layer
//! - [`tracker`] - BEP-3/15 HTTP and UDP tracker clients
//! - [`lsd`] - BEP-14 local service discovery
//! - [`utp`] - BEP-29 UDP transport
//! - [`bencode`] - BEP-3 bencode codec
//! - [`bandwidth`] / [`classes`] - Token buckets and peer classes
//! - [`storage`] - The disk subsystem boundary
//!
//! Torrent metadata parsing, on-disk storage, and port-mapping device
//! protocols are external collaborators behind the thin interfaces in
//! [`meta`], [`storage`] and [`portmap`].

pub mod bandwidth;
pub mod bencode;
pub mod classes;
pub mod clock;
pub mod constants;
pub mod dht;
pub mod gate;
pub mod lsd;
pub mod meta;
pub mod peer;
pub mod portmap;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracker;
pub mod utp;

pub use bencode::{decode, encode, BencodeError, Value};
pub use meta::{FileEntry, InfoHash, TorrentMeta};
pub use peer::{Bitfield, PeerConnection, PeerError, PeerId};
pub use session::{
    alert::{Alert, AlertQueue},
    AddTorrentParams, ChokerMode, Session, SessionSettings,
};
pub use storage::{DiskIo, MemoryDisk, StorageError};
pub use torrent::{Torrent, TorrentState};
