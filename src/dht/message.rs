//! KRPC message codec (BEP-5).
//!
//! Three message kinds, all bencoded dictionaries with a transaction id
//! under `t`: queries (`y:q`, method under `q`, arguments under `a`),
//! replies (`y:r`, return values under `r`), and errors (`y:e`, a
//! `[code, message]` list under `e`).

use std::net::SocketAddr;

use bytes::Bytes;

use super::error::DhtError;
use super::node::{encode_compact_nodes, parse_compact_nodes, parse_compact_peer, NodeId, NodeInfo};
use crate::bencode::{decode, encode, Value};
use crate::meta::InfoHash;

/// A query we can issue or answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode { target: NodeId },
    GetPeers { info_hash: InfoHash },
    AnnouncePeer {
        info_hash: InfoHash,
        port: u16,
        implied_port: bool,
        token: Bytes,
    },
}

impl Query {
    pub fn method(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

/// Return values of a reply, flattened across the query kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub id: Option<NodeId>,
    pub nodes: Vec<NodeInfo>,
    pub peers: Vec<SocketAddr>,
    pub token: Option<Bytes>,
}

/// One decoded KRPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KrpcMessage {
    Query {
        tid: Bytes,
        id: NodeId,
        query: Query,
    },
    Reply {
        tid: Bytes,
        reply: Reply,
    },
    Error {
        tid: Bytes,
        code: i64,
        message: String,
    },
}

impl KrpcMessage {
    pub fn tid(&self) -> &Bytes {
        match self {
            KrpcMessage::Query { tid, .. }
            | KrpcMessage::Reply { tid, .. }
            | KrpcMessage::Error { tid, .. } => tid,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut root = Value::dict();
        match self {
            KrpcMessage::Query { tid, id, query } => {
                root.insert(b"t", Value::Str(tid.clone()));
                root.insert(b"y", Value::str("q"));
                root.insert(b"q", Value::str(query.method()));

                let mut args = Value::dict();
                args.insert(b"id", Value::bytes(&id.0));
                match query {
                    Query::Ping => {}
                    Query::FindNode { target } => {
                        args.insert(b"target", Value::bytes(&target.0));
                    }
                    Query::GetPeers { info_hash } => {
                        args.insert(b"info_hash", Value::bytes(info_hash.as_bytes()));
                    }
                    Query::AnnouncePeer {
                        info_hash,
                        port,
                        implied_port,
                        token,
                    } => {
                        args.insert(b"info_hash", Value::bytes(info_hash.as_bytes()));
                        args.insert(b"port", Value::Int(*port as i64));
                        args.insert(b"implied_port", Value::Int(*implied_port as i64));
                        args.insert(b"token", Value::Str(token.clone()));
                    }
                }
                root.insert(b"a", args);
            }
            KrpcMessage::Reply { tid, reply } => {
                root.insert(b"t", Value::Str(tid.clone()));
                root.insert(b"y", Value::str("r"));

                let mut ret = Value::dict();
                if let Some(id) = reply.id {
                    ret.insert(b"id", Value::bytes(&id.0));
                }
                if !reply.nodes.is_empty() {
                    ret.insert(
                        b"nodes",
                        Value::Str(encode_compact_nodes(&reply.nodes).freeze()),
                    );
                }
                if !reply.peers.is_empty() {
                    let values: Vec<Value> = reply
                        .peers
                        .iter()
                        .filter_map(|p| super::node::encode_compact_peer(*p))
                        .map(|b| Value::bytes(&b))
                        .collect();
                    ret.insert(b"values", Value::List(values));
                }
                if let Some(token) = &reply.token {
                    ret.insert(b"token", Value::Str(token.clone()));
                }
                root.insert(b"r", ret);
            }
            KrpcMessage::Error { tid, code, message } => {
                root.insert(b"t", Value::Str(tid.clone()));
                root.insert(b"y", Value::str("e"));
                root.insert(
                    b"e",
                    Value::List(vec![Value::Int(*code), Value::str(message)]),
                );
            }
        }
        encode(&root)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DhtError> {
        let root = decode(data)?;
        let tid = root
            .get_bytes(b"t")
            .cloned()
            .ok_or(DhtError::InvalidMessage("missing 't'"))?;

        match root.get_str(b"y") {
            Some("q") => {
                let method = root
                    .get_str(b"q")
                    .ok_or(DhtError::InvalidMessage("missing 'q'"))?;
                let args = root
                    .get(b"a")
                    .ok_or(DhtError::InvalidMessage("missing 'a'"))?;
                let id = args
                    .get_bytes(b"id")
                    .and_then(|b| NodeId::from_bytes(b))
                    .ok_or(DhtError::InvalidMessage("missing sender id"))?;

                let query = match method {
                    "ping" => Query::Ping,
                    "find_node" => Query::FindNode {
                        target: args
                            .get_bytes(b"target")
                            .and_then(|b| NodeId::from_bytes(b))
                            .ok_or(DhtError::InvalidMessage("missing 'target'"))?,
                    },
                    "get_peers" => Query::GetPeers {
                        info_hash: args
                            .get_bytes(b"info_hash")
                            .and_then(|b| <[u8; 20]>::try_from(b.as_ref()).ok())
                            .map(InfoHash)
                            .ok_or(DhtError::InvalidMessage("missing 'info_hash'"))?,
                    },
                    "announce_peer" => Query::AnnouncePeer {
                        info_hash: args
                            .get_bytes(b"info_hash")
                            .and_then(|b| <[u8; 20]>::try_from(b.as_ref()).ok())
                            .map(InfoHash)
                            .ok_or(DhtError::InvalidMessage("missing 'info_hash'"))?,
                        port: args.get_int(b"port").unwrap_or(0).clamp(0, 65535) as u16,
                        implied_port: args.get_int(b"implied_port") == Some(1),
                        token: args
                            .get_bytes(b"token")
                            .cloned()
                            .ok_or(DhtError::InvalidMessage("missing 'token'"))?,
                    },
                    _ => return Err(DhtError::InvalidMessage("unknown method")),
                };
                Ok(KrpcMessage::Query { tid, id, query })
            }
            Some("r") => {
                let ret = root
                    .get(b"r")
                    .ok_or(DhtError::InvalidMessage("missing 'r'"))?;
                let mut reply = Reply {
                    id: ret.get_bytes(b"id").and_then(|b| NodeId::from_bytes(b)),
                    ..Reply::default()
                };
                if reply.id.is_none() {
                    return Err(DhtError::InvalidMessage("missing 'id'"));
                }
                if let Some(nodes) = ret.get_bytes(b"nodes") {
                    reply.nodes = parse_compact_nodes(nodes);
                }
                if let Some(values) = ret.get(b"values").and_then(Value::as_list) {
                    reply.peers = values
                        .iter()
                        .filter_map(Value::as_bytes)
                        .filter_map(|b| parse_compact_peer(b))
                        .collect();
                }
                reply.token = ret.get_bytes(b"token").cloned();
                Ok(KrpcMessage::Reply { tid, reply })
            }
            Some("e") => {
                let list = root
                    .get(b"e")
                    .and_then(Value::as_list)
                    .ok_or(DhtError::InvalidMessage("missing 'e'"))?;
                Ok(KrpcMessage::Error {
                    tid,
                    code: list.first().and_then(Value::as_int).unwrap_or(201),
                    message: list
                        .get(1)
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                })
            }
            _ => Err(DhtError::InvalidMessage("missing 'y'")),
        }
    }
}

/// The canonical error reply for an unknown transaction id.
pub fn invalid_transaction_error(tid: Bytes) -> KrpcMessage {
    KrpcMessage::Error {
        tid,
        code: 203,
        message: "invalid transaction id".to_string(),
    }
}
