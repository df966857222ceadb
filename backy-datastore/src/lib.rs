//! This crate implements the per-repository storage engine.
//!
//! # Data formats
//!
//! Backy splits a volume image into fixed size blocks of [CHUNK_SIZE]
//! bytes and stores them deduplicated in a content addressable chunk
//! store. A chunk is addressed by the MurmurHash3 x64-128 digest of its
//! plaintext and lives on disk as an LZO compressed file below
//! `chunks/<aa>/<id>.chunk.lzo`.
//!
//! A point-in-time image is a *revision*: a YAML metadata file
//! (`<uuid>.rev`) plus a packed chunk map (`<uuid>`) listing
//! `(block number, chunk id)` records. Blocks without a record are
//! holes and read back as zeroes. Every revision carries its complete
//! map, so revisions never reference each other on disk; the parent
//! relation is recomputed from timestamps.
//!
//! # Garbage collection
//!
//! Deleting a revision just removes its two files. Unreferenced chunks
//! are collected by a mark and sweep pass: collect the chunk ids of all
//! remaining revisions, then walk the chunk directory and unlink
//! everything else. Unlinks are issued in large batches with one
//! directory fsync per batch.
//!
//! # Locking
//!
//! All of this is guarded by one flock per repository
//! (`.backy.lock`): exclusive for mutating operations (backup, expire,
//! forget, verify, tag edits), shared for readers (status, restore).

use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Error};

pub mod chunk_map;
pub mod chunk_store;
pub mod prune;
pub mod repository;
pub mod revision;

pub use chunk_map::ChunkMap;
pub use chunk_store::ChunkStore;
pub use prune::Schedule;
pub use repository::Repository;
pub use revision::{Revision, RevisionSpec, Trust};

/// Size of an uncompressed chunk. Image files are split at multiples of
/// this offset; the last block of an image may be shorter.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Errors that callers tell apart programmatically. Everything else
/// travels as a plain [anyhow::Error].
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A chunk decompressed to content whose digest differs from its id.
    /// Taints the whole repository: every revision becomes distrusted.
    #[error("chunk {id} failed content verification")]
    Integrity { id: ChunkId },
    /// Another process holds the repository lock.
    #[error("repository lock {path:?} is held by another process")]
    LockHeld { path: PathBuf },
}

/// Content address of one chunk: the little-endian MurmurHash3 x64-128
/// digest of the plaintext, rendered as 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId([u8; 16]);

impl ChunkId {
    pub fn digest(data: &[u8]) -> Self {
        let hash = murmur3::murmur3_x64_128(&mut Cursor::new(data), 0)
            .expect("in-memory read is infallible");
        ChunkId(hash.to_le_bytes())
    }

    pub fn from_bytes(raw: [u8; 16]) -> Self {
        ChunkId(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First two hex characters, the fan-out directory name.
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self)
    }
}

impl FromStr for ChunkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let raw = hex::decode(s)?;
        let raw: [u8; 16] = match raw.try_into() {
            Ok(raw) => raw,
            Err(_) => bail!("chunk id must be 32 hex characters, got '{s}'"),
        };
        Ok(ChunkId(raw))
    }
}
