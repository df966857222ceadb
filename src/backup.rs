//! The backup driver: turns one pass over a source into a new
//! revision.
//!
//! Backups are reverse-incremental in the content-addressed sense:
//! every revision carries a complete chunk map, and dedup against the
//! chunk store is what makes unchanged data cheap. The source only
//! narrows *which* blocks get re-read.

use std::collections::{BTreeSet, HashSet};
use std::time::Instant;

use anyhow::Error;

use backy_datastore::chunk_map::ChunkMap;
use backy_datastore::repository::{is_integrity_error, Repository};
use backy_datastore::revision::Revision;
use backy_datastore::{ChunkId, Trust, CHUNK_SIZE};

use crate::source::{BackupSource, BlockSelection};
use crate::verify;

pub fn total_blocks(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE as u64) as u32
}

/// Takes a backup of `source` into `repo`, tagging the new revision
/// with `tags`. Holds the repository lock for the whole run.
pub fn backup(
    repo: &Repository,
    source: &mut dyn BackupSource,
    tags: BTreeSet<String>,
) -> Result<Revision, Error> {
    let _lock = repo.lock_exclusive()?;
    source.ready()?;

    let parent = repo.newest_completed()?;
    let mut rev = Revision::new(tags);
    let started = Instant::now();
    repo.log_event(&format!("starting backup {}", rev.uuid));

    source.snapshot_begin(&rev.uuid)?;
    match write_revision(repo, source, &mut rev, parent.as_ref(), started) {
        Ok(map) => {
            // sample against the still-open snapshot so the comparison
            // sees the same data the backup saw
            let sampled = verify::sample_after_backup(repo, &mut rev, &map, source);
            if let Err(err) = source.snapshot_end(true) {
                log::warn!("{}: snapshot release failed: {err:#}", rev.uuid);
            }
            sampled?;
            repo.log_event(&format!(
                "finished backup {} ({} bytes, {} new chunks, {} reused)",
                rev.uuid, rev.size, rev.stats.chunks_written, rev.stats.chunks_reused
            ));
            Ok(rev)
        }
        Err(err) => {
            repo.discard_partial(&rev);
            if let Err(end_err) = source.snapshot_end(false) {
                log::warn!("{}: snapshot release failed: {end_err:#}", rev.uuid);
            }
            if is_integrity_error(&err) {
                repo.distrust_all()?;
            }
            repo.log_event(&format!("backup {} failed: {err:#}", rev.uuid));
            Err(err)
        }
    }
}

fn write_revision(
    repo: &Repository,
    source: &mut dyn BackupSource,
    rev: &mut Revision,
    parent: Option<&Revision>,
    started: Instant,
) -> Result<ChunkMap, Error> {
    rev.size = source.size()?;
    // incomplete marker (duration 0) so concurrent readers see the run
    rev.save(repo.path())?;

    let total = total_blocks(rev.size);
    // a distrusted history disables incremental shortcuts entirely
    let full = parent.is_none()
        || parent.is_some_and(|p| p.trust == Trust::Distrusted)
        || repo.has_distrusted()?;
    let examined: BTreeSet<u32> = if full {
        (0..total).collect()
    } else {
        match source.blocks_to_examine(parent)? {
            BlockSelection::All => (0..total).collect(),
            BlockSelection::These(blocks) => blocks.into_iter().filter(|b| *b < total).collect(),
        }
    };
    let parent_map = match parent {
        Some(parent) => Some(repo.load_map(parent)?),
        None => None,
    };

    let store = repo.store();
    let mut map = ChunkMap::new();
    let mut seen_this_run: HashSet<ChunkId> = HashSet::new();

    for block in 0..total {
        if examined.contains(&block) {
            let data = source.read_block(block)?;
            rev.stats.bytes_read += data.len() as u64;
            if data.iter().all(|&b| b == 0) {
                continue; // hole
            }
            let id = ChunkId::digest(&data);
            if seen_this_run.contains(&id) || store.insert(&data, &id)? {
                rev.stats.chunks_reused += 1;
            } else {
                rev.stats.chunks_written += 1;
                rev.stats.bytes_written += data.len() as u64;
            }
            seen_this_run.insert(id);
            map.insert(block, id);
        } else if let Some(id) = parent_map.as_ref().and_then(|m| m.get(block)) {
            // untouched block, inherit the parent's mapping
            map.insert(block, *id);
        }
    }

    rev.duration = started.elapsed().as_secs_f64();
    repo.save_revision(rev, &map)?;
    Ok(map)
}
