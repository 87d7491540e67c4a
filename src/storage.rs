//! Interface to the disk subsystem.
//!
//! On-disk storage and the block cache live outside this crate. The engine
//! talks to them through [`DiskIo`]: jobs are submitted with a completion
//! channel and the reply re-enters the engine loop as an event, so the
//! reactor thread never blocks on disk. [`MemoryDisk`] is the in-memory
//! reference implementation used by tests.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::meta::InfoHash;

/// Errors surfaced by disk jobs.
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    /// The device ran out of space.
    #[error("disk full")]
    DiskFull,

    /// Read past the data we hold for a piece.
    #[error("read out of range")]
    OutOfRange,

    /// The torrent or piece is unknown to the store.
    #[error("unknown piece {piece} for {info_hash}")]
    UnknownPiece { info_hash: InfoHash, piece: u32 },

    /// Underlying I/O failure, carried as text because the job crossed a
    /// thread boundary.
    #[error("io error: {0}")]
    Io(String),
}

/// Completion channel for a disk job.
pub type DiskDone<T> = oneshot::Sender<Result<T, StorageError>>;

/// The disk subsystem boundary.
///
/// Implementations may execute jobs on worker threads; completions must
/// be delivered through the provided channel exactly once.
pub trait DiskIo: Send + Sync {
    /// Persists a verified piece.
    fn write_piece(&self, info_hash: InfoHash, piece: u32, data: Bytes, done: DiskDone<()>);

    /// Reads a block of a stored piece, for serving uploads.
    fn read_block(&self, info_hash: InfoHash, piece: u32, offset: u32, len: u32, done: DiskDone<Bytes>);

    /// Re-hashes a stored piece, for resume-data validation.
    fn hash_piece(&self, info_hash: InfoHash, piece: u32, done: DiskDone<[u8; 20]>);

    /// Drops all data for a torrent (the `remove_torrent` delete-files
    /// effect).
    fn delete_torrent(&self, info_hash: InfoHash);
}

/// In-memory [`DiskIo`] used by tests and seed-from-memory setups.
/// Completions are delivered inline.
#[derive(Default)]
pub struct MemoryDisk {
    pieces: Mutex<HashMap<(InfoHash, u32), Bytes>>,
}

impl MemoryDisk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pre-seeds a piece, bypassing the job interface.
    pub fn insert_piece(&self, info_hash: InfoHash, piece: u32, data: Bytes) {
        self.pieces.lock().insert((info_hash, piece), data);
    }

    pub fn piece(&self, info_hash: InfoHash, piece: u32) -> Option<Bytes> {
        self.pieces.lock().get(&(info_hash, piece)).cloned()
    }

    pub fn num_pieces(&self, info_hash: InfoHash) -> usize {
        self.pieces
            .lock()
            .keys()
            .filter(|(hash, _)| *hash == info_hash)
            .count()
    }
}

impl DiskIo for MemoryDisk {
    fn write_piece(&self, info_hash: InfoHash, piece: u32, data: Bytes, done: DiskDone<()>) {
        self.pieces.lock().insert((info_hash, piece), data);
        let _ = done.send(Ok(()));
    }

    fn read_block(&self, info_hash: InfoHash, piece: u32, offset: u32, len: u32, done: DiskDone<Bytes>) {
        let result = match self.pieces.lock().get(&(info_hash, piece)) {
            Some(data) => {
                let start = offset as usize;
                let end = start + len as usize;
                if end <= data.len() {
                    Ok(data.slice(start..end))
                } else {
                    Err(StorageError::OutOfRange)
                }
            }
            None => Err(StorageError::UnknownPiece { info_hash, piece }),
        };
        let _ = done.send(result);
    }

    fn hash_piece(&self, info_hash: InfoHash, piece: u32, done: DiskDone<[u8; 20]>) {
        let result = match self.pieces.lock().get(&(info_hash, piece)) {
            Some(data) => {
                let mut hasher = Sha1::new();
                hasher.update(data);
                Ok(hasher.finalize().into())
            }
            None => Err(StorageError::UnknownPiece { info_hash, piece }),
        };
        let _ = done.send(result);
    }

    fn delete_torrent(&self, info_hash: InfoHash) {
        self.pieces.lock().retain(|(hash, _), _| *hash != info_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv<T>(mut rx: oneshot::Receiver<Result<T, StorageError>>) -> Result<T, StorageError> {
        rx.try_recv().expect("completion delivered inline")
    }

    #[test]
    fn write_read_hash_round_trip() {
        let disk = MemoryDisk::new();
        let hash = InfoHash([3; 20]);
        let data = Bytes::from(vec![0u8; 16384]);

        let (tx, rx) = oneshot::channel();
        disk.write_piece(hash, 0, data.clone(), tx);
        recv(rx).unwrap();

        let (tx, rx) = oneshot::channel();
        disk.read_block(hash, 0, 0, 16384, tx);
        assert_eq!(recv(rx).unwrap(), data);

        let (tx, rx) = oneshot::channel();
        disk.hash_piece(hash, 0, tx);
        let digest = recv(rx).unwrap();

        let mut hasher = Sha1::new();
        hasher.update(&data);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(digest, expected);
    }

    #[test]
    fn read_out_of_range_fails() {
        let disk = MemoryDisk::new();
        let hash = InfoHash([3; 20]);
        disk.insert_piece(hash, 0, Bytes::from_static(b"abc"));

        let (tx, rx) = oneshot::channel();
        disk.read_block(hash, 0, 2, 4, tx);
        assert!(matches!(recv(rx), Err(StorageError::OutOfRange)));

        let (tx, rx) = oneshot::channel();
        disk.read_block(hash, 1, 0, 1, tx);
        assert!(matches!(recv(rx), Err(StorageError::UnknownPiece { .. })));
    }

    #[test]
    fn delete_torrent_drops_pieces() {
        let disk = MemoryDisk::new();
        let a = InfoHash([1; 20]);
        let b = InfoHash([2; 20]);
        disk.insert_piece(a, 0, Bytes::from_static(b"x"));
        disk.insert_piece(b, 0, Bytes::from_static(b"y"));
        disk.delete_torrent(a);
        assert_eq!(disk.num_pieces(a), 0);
        assert_eq!(disk.num_pieces(b), 1);
    }
}
