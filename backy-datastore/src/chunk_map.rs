//! Packed on-disk chunk map of one revision.
//!
//! The map file is a flat little-endian sequence of
//! `u32 offset_index || 16 byte chunk id` records, sorted by offset
//! ascending. Holes (all-zero blocks) have no record.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, format_err, Error};

use crate::ChunkId;

const RECORD_SIZE: usize = 4 + 16;

/// Sparse mapping `block number -> chunk id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkMap {
    entries: BTreeMap<u32, ChunkId>,
}

impl ChunkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, block: u32, id: ChunkId) {
        self.entries.insert(block, id);
    }

    pub fn get(&self, block: u32) -> Option<&ChunkId> {
        self.entries.get(&block)
    }

    /// Number of mapped (non-hole) blocks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, u32, ChunkId> {
        self.entries.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ChunkId> {
        self.entries.values()
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut raw = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut raw))
            .map_err(|err| format_err!("unable to read chunk map {path:?} - {err}"))?;
        if raw.len() % RECORD_SIZE != 0 {
            bail!(
                "chunk map {path:?} is truncated ({} bytes is not a record multiple)",
                raw.len()
            );
        }

        let mut entries = BTreeMap::new();
        let mut last: Option<u32> = None;
        for record in raw.chunks_exact(RECORD_SIZE) {
            let block = u32::from_le_bytes(record[..4].try_into().expect("record is 20 bytes"));
            if let Some(prev) = last {
                if block <= prev {
                    bail!("chunk map {path:?} is not sorted (block {block} after {prev})");
                }
            }
            last = Some(block);
            let id = ChunkId::from_bytes(record[4..].try_into().expect("record is 20 bytes"));
            entries.insert(block, id);
        }
        Ok(ChunkMap { entries })
    }

    /// Writes the map to a temp file next to `path` and renames it into
    /// place.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(self.entries.len() * RECORD_SIZE);
        for (block, id) in &self.entries {
            buf.extend_from_slice(&block.to_le_bytes());
            buf.extend_from_slice(id.as_bytes());
        }

        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path)
            .map_err(|err| format_err!("unable to create {tmp_path:?} - {err}"))?;
        if let Err(err) = file
            .write_all(&buf)
            .and_then(|_| file.sync_all())
            .and_then(|_| std::fs::rename(&tmp_path, path))
        {
            let _ = std::fs::remove_file(&tmp_path);
            bail!("writing chunk map {path:?} failed - {err}");
        }
        if let Some(dir) = path.parent() {
            let handle = File::open(dir)?;
            nix::unistd::fsync(handle.as_raw_fd())
                .map_err(|err| format_err!("fsync of {dir:?} failed - {err}"))?;
        }
        Ok(())
    }
}

impl FromIterator<(u32, ChunkId)> for ChunkMap {
    fn from_iter<T: IntoIterator<Item = (u32, ChunkId)>>(iter: T) -> Self {
        ChunkMap {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rev0");

        let mut map = ChunkMap::new();
        map.insert(0, ChunkId::digest(b"first"));
        map.insert(7, ChunkId::digest(b"after a hole"));
        map.insert(2, ChunkId::digest(b"middle"));
        map.save(&path).unwrap();

        let loaded = ChunkMap::load(&path).unwrap();
        assert_eq!(loaded, map);
        assert_eq!(loaded.len(), 3);
        assert!(loaded.get(1).is_none());
    }

    #[test]
    fn records_are_little_endian_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rev1");

        let id = ChunkId::digest(b"x");
        let map: ChunkMap = [(0x01020304, id)].into_iter().collect();
        map.save(&path).unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), RECORD_SIZE);
        assert_eq!(&raw[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&raw[4..], id.as_bytes());
    }

    #[test]
    fn load_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rev2");
        std::fs::write(&path, [0u8; RECORD_SIZE + 3]).unwrap();
        assert!(ChunkMap::load(&path).is_err());
    }

    #[test]
    fn load_rejects_unsorted_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rev3");
        let id = ChunkId::digest(b"x");
        let mut raw = Vec::new();
        for block in [5u32, 2u32] {
            raw.extend_from_slice(&block.to_le_bytes());
            raw.extend_from_slice(id.as_bytes());
        }
        std::fs::write(&path, raw).unwrap();
        assert!(ChunkMap::load(&path).is_err());
    }
}
