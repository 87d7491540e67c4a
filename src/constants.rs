//! Engine tuning parameters and protocol constants.
//!
//! Defaults follow libtorrent where nothing else pins a value. Settings in
//! [`crate::session::SessionSettings`] start from these and may be changed
//! at runtime; the raw protocol values below are fixed.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8] = b"-EB0001-";

/// Client version string advertised in the extended handshake `v` key
pub const CLIENT_VERSION: &str = "ebb/0.1.0";

// ============================================================================
// Wire protocol
// ============================================================================

/// BitTorrent protocol string carried in the handshake
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Length of the fixed handshake message
pub const HANDSHAKE_LEN: usize = 68;

/// Extension protocol bit (BEP-10), byte 5 of the reserved field
pub const EXTENSION_BIT: u8 = 0x10;

/// Fast extension bit (BEP-6), byte 7 of the reserved field
pub const FAST_EXTENSION_BIT: u8 = 0x04;

/// DHT support bit (BEP-5), byte 7 of the reserved field
pub const DHT_BIT: u8 = 0x01;

/// Standard block size; the transport granularity of a piece
pub const BLOCK_SIZE: u32 = 16384;

/// Maximum request length per BEP-3; larger requests are a protocol violation
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Hard cap on a single wire message
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Extension handshake message id within `Extended`
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

// ============================================================================
// Connection limits
// ============================================================================

/// Global connection limit
pub const DEFAULT_CONNECTIONS_LIMIT: usize = 200;

/// Slack above the global limit tolerated for incoming connections
pub const DEFAULT_CONNECTIONS_SLACK: usize = 10;

/// Maximum peers per torrent
pub const DEFAULT_MAX_CONNECTIONS_PER_TORRENT: usize = 50;

/// Concurrent `connect()` calls in flight (half-open gate)
pub const DEFAULT_HALF_OPEN_LIMIT: usize = 8;

/// Outbound connection attempts per tick
pub const DEFAULT_CONNECTION_SPEED: usize = 10;

/// Every n-th connection attempt goes to a finished torrent
pub const DEFAULT_CONNECT_SEED_EVERY_N: usize = 10;

/// Inbound block requests a peer may queue before we reject extras
pub const DEFAULT_MAX_ALLOWED_IN_REQUEST_QUEUE: usize = 250;

/// Inbound requests per tick beyond which a peer is considered abusive
pub const DEFAULT_MAX_REQUESTS_PER_TICK: usize = 2048;

/// Outstanding outbound block requests per peer, ceiling for the AIMD window
pub const DEFAULT_MAX_OUT_REQUEST_QUEUE: usize = 500;

/// Initial outbound request window
pub const INITIAL_REQUEST_WINDOW: usize = 4;

// ============================================================================
// Choking
// ============================================================================

/// Upload slots handed out by the unchoke scheduler
pub const DEFAULT_UNCHOKE_SLOTS: usize = 8;

/// Seconds between unchoke recomputations
pub const DEFAULT_UNCHOKE_INTERVAL: u64 = 15;

/// Seconds between optimistic unchoke rotations
pub const DEFAULT_OPTIMISTIC_UNCHOKE_INTERVAL: u64 = 30;

/// Rate-based choker: upload-rate step per additional slot
pub const RATE_CHOKER_STEP: u64 = 1024;

/// Bittyrant choker: assumed upload capacity when no limit is set
pub const BITTYRANT_DEFAULT_CAPACITY: u64 = 20_000;

/// Bittyrant choker: headroom added to the observed peak upload rate
pub const BITTYRANT_PEAK_HEADROOM: u64 = 10_000;

// ============================================================================
// Timeouts
// ============================================================================

/// TCP connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Handshake must complete within this after the transport connects
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Disconnect a peer that has been silent for this long
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(180);

/// Send a keep-alive when the outbound channel is idle this long
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Outstanding block requests time out after this
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Hash failures tolerated from one peer before it is banned
pub const HASHFAIL_THRESHOLD: u32 = 3;

// ============================================================================
// DHT
// ============================================================================

/// Transaction ids wrap at this value
pub const MAX_TRANSACTION_ID: u16 = 0x8000;

/// A silent DHT node is reported slow after this (traversal may fan out)
pub const DHT_SHORT_TIMEOUT: Duration = Duration::from_secs(3);

/// A silent DHT node fails hard after this
pub const DHT_HARD_TIMEOUT: Duration = Duration::from_secs(20);

/// Concurrent queries per traversal (Kademlia alpha)
pub const DHT_BRANCH_FACTOR: usize = 3;

/// Result-set width per traversal (Kademlia k)
pub const DHT_MAX_RESULTS: usize = 8;

/// Seconds between DHT announce rounds over all torrents
pub const DEFAULT_DHT_ANNOUNCE_INTERVAL: u64 = 15 * 60;

/// Well-known DHT bootstrap nodes
pub const DHT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
];

// ============================================================================
// Trackers
// ============================================================================

/// Fallback announce interval when the tracker does not send one
pub const TRACKER_DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);

/// Base delay for tier back-off after a failed announce
pub const TRACKER_BACKOFF_BASE: Duration = Duration::from_secs(60);

/// Back-off exponent cap
pub const TRACKER_BACKOFF_MAX_EXP: u32 = 5;

/// HTTP tracker request timeout
pub const HTTP_TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

/// UDP tracker request timeout, doubled per retry
pub const UDP_TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// UDP tracker retries before the announce fails
pub const UDP_TRACKER_RETRIES: u32 = 3;

/// UDP tracker protocol magic
pub const UDP_TRACKER_PROTOCOL_ID: u64 = 0x41727101980;

/// Peers requested per announce
pub const DEFAULT_NUM_WANT: i32 = 50;

// ============================================================================
// LSD
// ============================================================================

/// LSD multicast port (BEP-14)
pub const LSD_PORT: u16 = 6771;

/// Seconds between LSD announce rounds
pub const DEFAULT_LSD_ANNOUNCE_INTERVAL: u64 = 5 * 60;

// ============================================================================
// uTP
// ============================================================================

/// uTP header size without extensions
pub const UTP_HEADER_LEN: usize = 20;

/// LEDBAT one-way delay target
pub const UTP_TARGET_DELAY: Duration = Duration::from_millis(100);

/// Maximum uTP payload per packet
pub const UTP_MTU: usize = 1400;

/// Floor for the retransmission timer
pub const UTP_MIN_RTO: Duration = Duration::from_millis(500);

/// How long a closing uTP socket may linger after session abort
pub const UTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Session scheduling
// ============================================================================

/// Seconds between auto-manage recomputations
pub const DEFAULT_AUTO_MANAGE_INTERVAL: u64 = 30;

/// Grace period within which a started torrent must produce payload
/// before it counts against the active limits
pub const DEFAULT_AUTO_MANAGE_STARTUP: u64 = 60;

/// Port-increment attempts before falling back to an OS-chosen port
pub const DEFAULT_MAX_RETRY_PORT_BIND: u32 = 10;

/// Default alert queue capacity
pub const DEFAULT_ALERT_QUEUE_SIZE: usize = 1000;

/// Send-buffer watermark floor; the effective watermark scales with the
/// peer's upload rate
pub const SEND_BUFFER_WATERMARK_MIN: usize = 512 * 1024;

/// Remaining unrequested blocks below which the picker enters end-game
pub const ENDGAME_BLOCK_THRESHOLD: usize = 16;
