//! Resume data: the bencoded per-torrent checkpoint.
//!
//! Captures verified pieces, tracker list, priorities, and known peers so
//! a torrent restarts without a full recheck. Readers ignore unknown keys
//! so the format can grow.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;

use crate::bencode::{decode, encode, BencodeError, Value};
use crate::meta::InfoHash;

const FILE_FORMAT: &str = "libtorrent resume file";
const FILE_VERSION: i64 = 1;

/// Decoded resume data.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeData {
    pub info_hash: InfoHash,
    /// Bitfield of verified pieces, wire layout.
    pub pieces: Bytes,
    pub trackers: Vec<(String, u8)>,
    pub save_path: String,
    /// Known good peers, for reconnecting ahead of the first announce.
    pub peers: Vec<SocketAddr>,
    pub piece_priority: Vec<u8>,
    pub file_priority: Vec<u8>,
    pub allocation: String,
    pub blocks_per_piece: u32,
}

impl ResumeData {
    pub fn encode(&self) -> Vec<u8> {
        let mut root = Value::dict();
        root.insert(b"file-format", Value::str(FILE_FORMAT));
        root.insert(b"file-version", Value::Int(FILE_VERSION));
        root.insert(b"info-hash", Value::bytes(self.info_hash.as_bytes()));
        root.insert(b"pieces", Value::Str(self.pieces.clone()));
        root.insert(b"save_path", Value::str(&self.save_path));
        root.insert(b"allocation", Value::str(&self.allocation));
        root.insert(b"blocks per piece", Value::Int(self.blocks_per_piece as i64));

        let trackers: Vec<Value> = self
            .trackers
            .iter()
            .map(|(url, tier)| {
                Value::List(vec![Value::str(url), Value::Int(*tier as i64)])
            })
            .collect();
        root.insert(b"trackers", Value::List(trackers));

        if !self.peers.is_empty() {
            let mut packed = Vec::with_capacity(self.peers.len() * 6);
            for peer in &self.peers {
                if let SocketAddr::V4(v4) = peer {
                    packed.extend_from_slice(&v4.ip().octets());
                    packed.extend_from_slice(&v4.port().to_be_bytes());
                }
            }
            root.insert(b"peers", Value::bytes(&packed));
        }
        if !self.piece_priority.is_empty() {
            root.insert(b"piece_priority", Value::bytes(&self.piece_priority));
        }
        if !self.file_priority.is_empty() {
            let prios: Vec<Value> = self
                .file_priority
                .iter()
                .map(|p| Value::Int(*p as i64))
                .collect();
            root.insert(b"file_priority", Value::List(prios));
        }

        encode(&root)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ResumeError> {
        let root = decode(data)?;

        match root.get_str(b"file-format") {
            Some(FILE_FORMAT) => {}
            _ => return Err(ResumeError::BadFormat),
        }

        let info_hash = root
            .get_bytes(b"info-hash")
            .and_then(|b| <[u8; 20]>::try_from(b.as_ref()).ok())
            .map(InfoHash)
            .ok_or(ResumeError::MissingKey("info-hash"))?;

        let pieces = root
            .get_bytes(b"pieces")
            .cloned()
            .ok_or(ResumeError::MissingKey("pieces"))?;

        let mut trackers = Vec::new();
        if let Some(list) = root.get(b"trackers").and_then(Value::as_list) {
            for entry in list {
                if let Some(pair) = entry.as_list() {
                    if let (Some(url), tier) = (
                        pair.first().and_then(Value::as_str),
                        pair.get(1).and_then(Value::as_int).unwrap_or(0),
                    ) {
                        trackers.push((url.to_string(), tier.clamp(0, 255) as u8));
                    }
                }
            }
        }

        let mut peers = Vec::new();
        if let Some(packed) = root.get_bytes(b"peers") {
            for chunk in packed.chunks_exact(6) {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
        }

        let piece_priority = root
            .get_bytes(b"piece_priority")
            .map(|b| b.to_vec())
            .unwrap_or_default();

        let file_priority = root
            .get(b"file_priority")
            .and_then(Value::as_list)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_int)
                    .map(|p| p.clamp(0, 7) as u8)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            info_hash,
            pieces,
            trackers,
            save_path: root.get_str(b"save_path").unwrap_or("").to_string(),
            peers,
            piece_priority,
            file_priority,
            allocation: root.get_str(b"allocation").unwrap_or("sparse").to_string(),
            blocks_per_piece: root
                .get_int(b"blocks per piece")
                .unwrap_or(1)
                .clamp(1, 1 << 20) as u32,
        })
    }
}

/// Resume decode failures.
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("not a resume file")]
    BadFormat,

    #[error("missing key: {0}")]
    MissingKey(&'static str),
}

/// Convenience for building the `unfinished` section: partial pieces and
/// which blocks are done, so a restart does not re-download them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnfinishedPiece {
    pub piece: u32,
    /// Little bitmap of finished blocks.
    pub blocks: Vec<u8>,
}

impl UnfinishedPiece {
    pub fn to_value(&self) -> Value {
        let mut dict = Value::dict();
        dict.insert(b"piece", Value::Int(self.piece as i64));
        dict.insert(b"bitmask", Value::bytes(&self.blocks));
        dict
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            piece: value.get_int(b"piece")? as u32,
            blocks: value.get_bytes(b"bitmask")?.to_vec(),
        })
    }
}
