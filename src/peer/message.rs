//! Peer wire protocol messages (BEP-3, BEP-6, BEP-10).
//!
//! Messages after the handshake are length-prefixed: a 4-byte big-endian
//! length, then a 1-byte message id and payload. Length zero is a
//! keep-alive. The decoder validates payload lengths per id, since most
//! fixed-size messages admit exactly one length.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;
use crate::constants::{
    DHT_BIT, EXTENSION_BIT, FAST_EXTENSION_BIT, HANDSHAKE_LEN, PROTOCOL_STRING,
};

/// The 68-byte handshake opening every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// A handshake advertising the extension protocol, fast extension
    /// and DHT support.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= EXTENSION_BIT;
        reserved[7] |= FAST_EXTENSION_BIT | DHT_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & EXTENSION_BIT != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[7] & FAST_EXTENSION_BIT != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & DHT_BIT != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }
        if data[0] as usize != PROTOCOL_STRING.len() || &data[1..20] != PROTOCOL_STRING {
            return Err(PeerError::InvalidHandshake);
        }
        let mut hs = Self {
            reserved: [0; 8],
            info_hash: [0; 20],
            peer_id: [0; 20],
        };
        hs.reserved.copy_from_slice(&data[20..28]);
        hs.info_hash.copy_from_slice(&data[28..48]);
        hs.peer_id.copy_from_slice(&data[48..68]);
        Ok(hs)
    }
}

/// Message ids on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    DhtPort = 9,
    // fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // extension protocol (BEP-10)
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(id: u8) -> Result<Self, PeerError> {
        Ok(match id {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::DhtPort,
            13 => MessageId::Suggest,
            14 => MessageId::HaveAll,
            15 => MessageId::HaveNone,
            16 => MessageId::Reject,
            17 => MessageId::AllowedFast,
            20 => MessageId::Extended,
            other => return Err(PeerError::UnknownMessageId(other)),
        })
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    DhtPort(u16),
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { piece: u32 },
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Encodes the message including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        4 + match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => 1,
            Message::Have { .. } | Message::Suggest { .. } | Message::AllowedFast { .. } => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request { .. } | Message::Cancel { .. } | Message::Reject { .. } => 13,
            Message::Piece { data, .. } => 9 + data.len(),
            Message::DhtPort(_) => 3,
            Message::Extended { payload, .. } => 2 + payload.len(),
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.encoded_len() as u32 - 4);
        let id = match self {
            Message::KeepAlive => return,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::DhtPort(_) => MessageId::DhtPort,
            Message::Suggest { .. } => MessageId::Suggest,
            Message::HaveAll => MessageId::HaveAll,
            Message::HaveNone => MessageId::HaveNone,
            Message::Reject { .. } => MessageId::Reject,
            Message::AllowedFast { .. } => MessageId::AllowedFast,
            Message::Extended { .. } => MessageId::Extended,
        };
        buf.put_u8(id as u8);
        match self {
            Message::Have { piece }
            | Message::Suggest { piece }
            | Message::AllowedFast { piece } => buf.put_u32(*piece),
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            }
            | Message::Reject {
                index,
                begin,
                length,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::DhtPort(port) => buf.put_u16(*port),
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            _ => {}
        }
    }

    /// Decodes one framed message. `frame` is the payload after the
    /// length prefix; an empty frame is a keep-alive.
    pub fn decode(mut frame: Bytes) -> Result<Self, PeerError> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = MessageId::try_from(frame.get_u8())?;
        let body = frame.len();

        let exact = |want: usize, what: &'static str| {
            if body == want {
                Ok(())
            } else {
                Err(PeerError::InvalidMessage(what))
            }
        };

        Ok(match id {
            MessageId::Choke => {
                exact(0, "choke payload")?;
                Message::Choke
            }
            MessageId::Unchoke => {
                exact(0, "unchoke payload")?;
                Message::Unchoke
            }
            MessageId::Interested => {
                exact(0, "interested payload")?;
                Message::Interested
            }
            MessageId::NotInterested => {
                exact(0, "not-interested payload")?;
                Message::NotInterested
            }
            MessageId::Have => {
                exact(4, "have length")?;
                Message::Have {
                    piece: frame.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield(frame),
            MessageId::Request => {
                exact(12, "request length")?;
                Message::Request {
                    index: frame.get_u32(),
                    begin: frame.get_u32(),
                    length: frame.get_u32(),
                }
            }
            MessageId::Piece => {
                if body < 8 {
                    return Err(PeerError::InvalidMessage("piece header"));
                }
                let index = frame.get_u32();
                let begin = frame.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: frame,
                }
            }
            MessageId::Cancel => {
                exact(12, "cancel length")?;
                Message::Cancel {
                    index: frame.get_u32(),
                    begin: frame.get_u32(),
                    length: frame.get_u32(),
                }
            }
            MessageId::DhtPort => {
                exact(2, "dht port length")?;
                Message::DhtPort(frame.get_u16())
            }
            MessageId::Suggest => {
                exact(4, "suggest length")?;
                Message::Suggest {
                    piece: frame.get_u32(),
                }
            }
            MessageId::HaveAll => {
                exact(0, "have-all payload")?;
                Message::HaveAll
            }
            MessageId::HaveNone => {
                exact(0, "have-none payload")?;
                Message::HaveNone
            }
            MessageId::Reject => {
                exact(12, "reject length")?;
                Message::Reject {
                    index: frame.get_u32(),
                    begin: frame.get_u32(),
                    length: frame.get_u32(),
                }
            }
            MessageId::AllowedFast => {
                exact(4, "allowed-fast length")?;
                Message::AllowedFast {
                    piece: frame.get_u32(),
                }
            }
            MessageId::Extended => {
                if body < 1 {
                    return Err(PeerError::InvalidMessage("extended header"));
                }
                let ext_id = frame.get_u8();
                Message::Extended {
                    id: ext_id,
                    payload: frame,
                }
            }
        })
    }
}
