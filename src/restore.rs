//! Restore a revision into a file, block device or stdout.
//!
//! The destination is write-only: chunks land at their offsets, holes
//! are produced by truncation (regular files) or explicit zeroes
//! (devices, pipes). Nothing is ever read back from the target.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use anyhow::{bail, format_err, Error};

use backy_datastore::repository::Repository;
use backy_datastore::revision::RevisionSpec;
use backy_datastore::CHUNK_SIZE;

use crate::backup::total_blocks;

pub enum RestoreTarget {
    File(PathBuf),
    Stdout,
}

pub fn restore(repo: &Repository, spec: &RevisionSpec, target: &RestoreTarget) -> Result<(), Error> {
    let result = {
        let _lock = repo.lock_shared()?;

        let found = repo.find(spec)?;
        let rev = match found.as_slice() {
            [rev] => rev,
            _ => bail!(
                "restore needs exactly one revision, specification matched {}",
                found.len()
            ),
        };
        if !rev.is_completed() {
            bail!("revision {} is incomplete", rev.uuid);
        }
        let map = repo.load_map(rev)?;

        match target {
            RestoreTarget::File(path) => restore_to_file(repo, rev.size, &map, path),
            RestoreTarget::Stdout => {
                restore_to_stream(repo, rev.size, &map, &mut std::io::stdout().lock())
            }
        }
    };
    if let Err(err) = &result {
        if backy_datastore::repository::is_integrity_error(err) {
            repo.distrust_all()?;
        }
    }
    result
}

fn restore_to_file(
    repo: &Repository,
    size: u64,
    map: &backy_datastore::ChunkMap,
    path: &PathBuf,
) -> Result<(), Error> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .map_err(|err| format_err!("unable to open restore target {path:?} - {err}"))?;

    let is_regular = file.metadata()?.file_type().is_file();
    if is_regular {
        // pre-allocation is a throughput hint; filesystems without
        // support just take the slow path
        let res = nix::fcntl::posix_fallocate(file.as_raw_fd(), 0, size as i64);
        if let Err(err) = res {
            log::debug!("preallocation of {path:?} not available: {err}");
        }
        file.set_len(size)?;
    }

    let mut hole_filler = HoleFiller::new(is_regular);
    for (block, id) in map.iter() {
        let offset = *block as u64 * CHUNK_SIZE as u64;
        let data = repo.store().get(id)?;
        hole_filler.cover_up_to(&file, *block, size)?;
        file.write_all_at(&data, offset)?;
        hole_filler.advance(*block);
    }
    hole_filler.cover_tail(&file, size)?;

    file.sync_all()?;
    Ok(())
}

/// Zero-fills the gaps between written blocks on targets where
/// truncation does not produce them (block devices). On regular files
/// `set_len` already guarantees zeroes, so this is a no-op there.
struct HoleFiller {
    skip: bool,
    next_unwritten: u32,
}

impl HoleFiller {
    fn new(is_regular: bool) -> Self {
        HoleFiller {
            skip: is_regular,
            next_unwritten: 0,
        }
    }

    fn cover_up_to(&mut self, file: &std::fs::File, block: u32, size: u64) -> Result<(), Error> {
        if self.skip {
            return Ok(());
        }
        for hole in self.next_unwritten..block {
            write_zero_block(file, hole, size)?;
        }
        Ok(())
    }

    fn advance(&mut self, written: u32) {
        self.next_unwritten = written + 1;
    }

    fn cover_tail(&mut self, file: &std::fs::File, size: u64) -> Result<(), Error> {
        if self.skip {
            return Ok(());
        }
        for hole in self.next_unwritten..total_blocks(size) {
            write_zero_block(file, hole, size)?;
        }
        Ok(())
    }
}

fn write_zero_block(file: &std::fs::File, block: u32, size: u64) -> Result<(), Error> {
    let offset = block as u64 * CHUNK_SIZE as u64;
    let len = (size.saturating_sub(offset) as usize).min(CHUNK_SIZE);
    file.write_all_at(&vec![0u8; len], offset)?;
    Ok(())
}

/// Sequential writeout for non-seekable sinks.
fn restore_to_stream<W: Write>(
    repo: &Repository,
    size: u64,
    map: &backy_datastore::ChunkMap,
    out: &mut W,
) -> Result<(), Error> {
    for block in 0..total_blocks(size) {
        let offset = block as u64 * CHUNK_SIZE as u64;
        let len = (size.saturating_sub(offset) as usize).min(CHUNK_SIZE);
        match map.get(block) {
            Some(id) => {
                let mut data = repo.store().get(id)?;
                // holes after a shrinking source read are padded out
                data.resize(len, 0);
                out.write_all(&data)?;
            }
            None => out.write_all(&vec![0u8; len])?,
        }
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_restore_pads_holes() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let (id, _) = repo.store().put(b"abc").unwrap();
        let map: backy_datastore::ChunkMap = [(1u32, id)].into_iter().collect();

        let size = CHUNK_SIZE as u64 + 3;
        let mut out = Vec::new();
        restore_to_stream(&repo, size, &map, &mut out).unwrap();
        assert_eq!(out.len(), size as usize);
        assert!(out[..CHUNK_SIZE].iter().all(|&b| b == 0));
        assert_eq!(&out[CHUNK_SIZE..], b"abc");
    }
}
