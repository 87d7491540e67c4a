//! Peer wire protocol and the per-peer state machine.
//!
//! [`message`] is the codec (BEP-3 plus the fast extension and the
//! extension protocol), [`transport`] the socket pumps that own the
//! actual sockets, and [`connection`] the protocol state machine the
//! engine drives. The state machine performs no I/O of its own.

mod bitfield;
mod connection;
mod error;
mod extension;
mod message;
mod peer_id;
mod transport;

pub use bitfield::Bitfield;
pub use connection::{ConnId, Incoming, PeerConnection, PeerState, PeerStats, TickAction};
pub use error::{DisconnectOp, PeerError};
pub use extension::ExtensionHandshake;
pub use message::{Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use transport::{
    spawn_incoming, spawn_outgoing, spawn_outgoing_stream, PeerStream, PumpEvent, PumpHandle,
    PumpLimits,
};

#[cfg(test)]
pub(crate) use transport::test_pump;

#[cfg(test)]
mod tests;
