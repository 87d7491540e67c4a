//! Extension protocol handshake (BEP-10).
//!
//! When both handshakes set the extension bit, each side sends an
//! `Extended` message with id 0 carrying a bencoded dictionary: `m` maps
//! extension names to the message ids the sender will accept them on,
//! plus optional `v` (client), `p` (listen port), `yourip`, and `reqq`
//! (request-queue depth the sender allows).

use std::collections::BTreeMap;
use std::net::IpAddr;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{decode, encode, Value};
use crate::constants::CLIENT_VERSION;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionHandshake {
    /// Extension name to message id. Id 0 means the extension is dropped.
    pub extensions: BTreeMap<String, u8>,
    /// Client name and version.
    pub client: Option<String>,
    /// The sender's listen port.
    pub port: Option<u16>,
    /// The address the sender sees us as.
    pub yourip: Option<IpAddr>,
    /// Outstanding requests the sender is willing to queue from us.
    pub reqq: Option<i64>,
}

impl ExtensionHandshake {
    /// Our handshake: client string, listen port, the peer's address as
    /// we see it, and our inbound request-queue depth.
    pub fn ours(port: u16, peer_ip: IpAddr, reqq: usize) -> Self {
        Self {
            extensions: BTreeMap::new(),
            client: Some(CLIENT_VERSION.to_string()),
            port: Some(port),
            yourip: Some(peer_ip),
            reqq: Some(reqq as i64),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut root = Value::dict();

        let m: BTreeMap<Bytes, Value> = self
            .extensions
            .iter()
            .map(|(name, id)| {
                (
                    Bytes::copy_from_slice(name.as_bytes()),
                    Value::Int(*id as i64),
                )
            })
            .collect();
        root.insert(b"m", Value::Dict(m));

        if let Some(client) = &self.client {
            root.insert(b"v", Value::str(client));
        }
        if let Some(port) = self.port {
            root.insert(b"p", Value::Int(port as i64));
        }
        if let Some(ip) = self.yourip {
            let bytes = match ip {
                IpAddr::V4(v4) => Value::bytes(&v4.octets()),
                IpAddr::V6(v6) => Value::bytes(&v6.octets()),
            };
            root.insert(b"yourip", bytes);
        }
        if let Some(reqq) = self.reqq {
            root.insert(b"reqq", Value::Int(reqq));
        }

        Bytes::from(encode(&root))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let root = decode(payload)?;
        if root.as_dict().is_none() {
            return Err(PeerError::InvalidMessage("extended handshake not a dict"));
        }

        let mut hs = Self::default();

        if let Some(m) = root.get(b"m").and_then(Value::as_dict) {
            for (name, id) in m {
                if let (Ok(name), Some(id)) = (std::str::from_utf8(name), id.as_int()) {
                    if (0..=255).contains(&id) {
                        hs.extensions.insert(name.to_string(), id as u8);
                    }
                }
            }
        }

        hs.client = root.get_str(b"v").map(String::from);
        hs.port = root
            .get_int(b"p")
            .filter(|p| (1..=u16::MAX as i64).contains(p))
            .map(|p| p as u16);
        hs.yourip = root.get_bytes(b"yourip").and_then(|b| match b.len() {
            4 => <[u8; 4]>::try_from(b.as_ref()).ok().map(|o| IpAddr::from(o)),
            16 => <[u8; 16]>::try_from(b.as_ref()).ok().map(|o| IpAddr::from(o)),
            _ => None,
        });
        hs.reqq = root.get_int(b"reqq").filter(|&q| q > 0);

        Ok(hs)
    }

    /// The message id the peer accepts `name` on, if advertised.
    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied().filter(|&id| id != 0)
    }
}
