use thiserror::Error;

/// Errors that can occur on a peer connection.
///
/// The variants preserve the disconnect taxonomy: transport failures,
/// protocol violations (immediate disconnect, distinct alert kind), and
/// recoverable conditions that only cost trust.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O failure (refused, reset, EOF, unreachable).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connect, handshake, or inactivity timeout.
    #[error("timed out")]
    Timeout,

    /// The handshake was not 68 bytes of "BitTorrent protocol".
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The handshake named a torrent this session does not have.
    #[error("unknown info hash")]
    UnknownInfoHash,

    /// Malformed message framing or payload.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// A message id outside the protocol.
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),

    /// A message larger than the wire cap.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// A block request outside the piece bounds.
    #[error("request out of range")]
    RequestOutOfRange,

    /// The peer queued more requests than allowed in one tick.
    #[error("excessive requests")]
    ExcessiveRequests,

    /// Too many pieces from this peer failed their hash check.
    #[error("hash failures over threshold")]
    HashFailures,

    /// Error in a bencoded extension payload.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// The session is shutting down.
    #[error("session closing")]
    SessionClosing,
}

impl PeerError {
    /// True for violations that warrant an immediate BAD_PROTOCOL
    /// disconnect rather than a transport-error disconnect.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PeerError::InvalidHandshake
                | PeerError::UnknownInfoHash
                | PeerError::InvalidMessage(_)
                | PeerError::UnknownMessageId(_)
                | PeerError::MessageTooLarge(_)
                | PeerError::RequestOutOfRange
                | PeerError::ExcessiveRequests
                | PeerError::HashFailures
                | PeerError::Bencode(_)
        )
    }
}

/// The operation in progress when a connection failed, for alerts and
/// counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOp {
    Connect,
    Handshake,
    Read,
    Write,
    Tick,
    Abort,
}
