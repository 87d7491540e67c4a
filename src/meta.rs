//! Torrent identity and layout.
//!
//! Metadata *parsing* is not this crate's job; a `.torrent` or magnet
//! resolver hands the engine a ready-made [`TorrentMeta`]. What lives here
//! is the identity type every subsystem keys on ([`InfoHash`]) and the
//! piece/block geometry the picker and peers need.

use std::fmt;

/// A 20-byte SHA-1 content identifier; the primary key for torrents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parses a 40-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 40 {
            return None;
        }
        let bytes = hex_decode(s)?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }

    /// Percent-encodes every byte, for tracker announce URLs.
    pub fn url_encode(&self) -> String {
        self.0.iter().fold(String::with_capacity(60), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "%{:02x}", b);
            s
        })
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// One file within a torrent's layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the save directory.
    pub path: String,
    /// File length in bytes.
    pub length: u64,
    /// Byte offset of this file within the concatenated torrent data.
    pub offset: u64,
}

/// Parsed torrent metadata, as delivered by the external metadata codec.
///
/// For magnet-added torrents this is absent until fetched; the torrent
/// runs metadata-less until then.
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub info_hash: InfoHash,
    pub name: String,
    /// Piece size; a power of two, at least 16 KiB, except possibly the
    /// last piece.
    pub piece_length: u32,
    /// One SHA-1 per piece.
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub total_len: u64,
}

impl TorrentMeta {
    /// Single-file constructor, mostly for tests and simple torrents.
    pub fn single_file(
        info_hash: InfoHash,
        name: &str,
        piece_length: u32,
        piece_hashes: Vec<[u8; 20]>,
        total_len: u64,
    ) -> Self {
        Self {
            info_hash,
            name: name.to_string(),
            piece_length,
            piece_hashes,
            files: vec![FileEntry {
                path: name.to_string(),
                length: total_len,
                offset: 0,
            }],
            total_len,
        }
    }

    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Actual length of piece `index`; the last piece may be short.
    pub fn piece_len(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        let remaining = self.total_len.saturating_sub(start);
        remaining.min(self.piece_length as u64) as u32
    }

    /// Number of transport blocks in piece `index`.
    pub fn blocks_in_piece(&self, index: u32) -> u32 {
        self.piece_len(index).div_ceil(crate::constants::BLOCK_SIZE)
    }

    /// Length of block `block` within piece `index`.
    pub fn block_len(&self, index: u32, block: u32) -> u32 {
        let piece_len = self.piece_len(index);
        let offset = block * crate::constants::BLOCK_SIZE;
        piece_len
            .saturating_sub(offset)
            .min(crate::constants::BLOCK_SIZE)
    }

    /// Validates that a request's offset and length fall inside the piece.
    pub fn request_in_range(&self, index: u32, offset: u32, length: u32) -> bool {
        if index >= self.num_pieces() || length == 0 {
            return false;
        }
        let piece_len = self.piece_len(index) as u64;
        (offset as u64 + length as u64) <= piece_len
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

pub(crate) fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(piece_length: u32, total_len: u64) -> TorrentMeta {
        let pieces = (total_len as f64 / piece_length as f64).ceil() as usize;
        TorrentMeta::single_file(
            InfoHash([1; 20]),
            "t",
            piece_length,
            vec![[0u8; 20]; pieces],
            total_len,
        )
    }

    #[test]
    fn info_hash_hex_round_trip() {
        let hash = InfoHash([0xab; 20]);
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(InfoHash::from_hex(&hex), Some(hash));
        assert_eq!(InfoHash::from_hex("zz"), None);
    }

    #[test]
    fn piece_geometry() {
        let m = meta(32768, 100_000);
        assert_eq!(m.num_pieces(), 4);
        assert_eq!(m.piece_len(0), 32768);
        assert_eq!(m.piece_len(3), 100_000 - 3 * 32768);
        assert_eq!(m.blocks_in_piece(0), 2);
        assert_eq!(m.blocks_in_piece(3), 1);
        assert_eq!(m.block_len(0, 0), 16384);
        assert_eq!(m.block_len(3, 0), m.piece_len(3));
    }

    #[test]
    fn request_range_checks() {
        let m = meta(16384, 16384);
        assert!(m.request_in_range(0, 0, 16384));
        assert!(!m.request_in_range(0, 0, 16385));
        assert!(!m.request_in_range(0, 16384, 1));
        assert!(!m.request_in_range(1, 0, 1));
        assert!(!m.request_in_range(0, 0, 0));
    }
}
