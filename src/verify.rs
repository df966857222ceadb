//! Content verification: the cheap sampling pass after every backup
//! and the full pass that clears (or removes) distrusted revisions.

use std::time::{Duration, Instant};

use anyhow::Error;
use rand::seq::index::sample;

use backy_datastore::chunk_map::ChunkMap;
use backy_datastore::repository::{is_integrity_error, Repository};
use backy_datastore::revision::Revision;
use backy_datastore::{ChunkId, Trust};

use crate::backup::total_blocks;
use crate::source::BackupSource;

/// Upper bound on sampled blocks per backup.
const SAMPLE_BLOCKS: usize = 1000;

/// Full-image verification stops after this budget and leaves the
/// current trust in place, unless a mismatch already turned up.
const VERIFY_BUDGET: Duration = Duration::from_secs(300);

/// Re-reads a random sample of blocks from the source and compares
/// them with what the backup stored. A mismatch never fails the
/// backup; it quarantines the source bytes and demotes the fresh
/// revision to distrusted so the next run goes full.
pub fn sample_after_backup(
    repo: &Repository,
    rev: &mut Revision,
    map: &ChunkMap,
    source: &mut dyn BackupSource,
) -> Result<(), Error> {
    let total = total_blocks(rev.size) as usize;
    let picks = sample(&mut rand::thread_rng(), total, total.min(SAMPLE_BLOCKS));

    let mut mismatches = 0;
    for block in picks.iter().map(|i| i as u32) {
        let fresh = source.read_block(block)?;
        let matches = match map.get(block) {
            Some(id) => repo.store().get(id)? == fresh,
            None => fresh.iter().all(|&b| b == 0),
        };
        if !matches {
            mismatches += 1;
            repo.quarantine(&ChunkId::digest(&fresh), &fresh)?;
        }
    }

    if mismatches > 0 {
        log::warn!(
            "{}: {mismatches} of {} sampled blocks disagree with the source",
            rev.uuid,
            picks.len()
        );
        rev.trust = Trust::Distrusted;
        rev.save(repo.path())?;
        repo.store().set_paranoid(true);
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct VerifySummary {
    pub verified: usize,
    pub removed: usize,
    /// Revisions whose pass ran out of budget; trust unchanged.
    pub unfinished: usize,
}

/// Verifies every distrusted revision: each mapped chunk is read
/// through the store (which re-hashes) and, when a source is
/// available, compared against a fresh source read. Full success
/// promotes to verified, any mismatch forgets the revision.
pub fn verify_distrusted<'a>(
    repo: &Repository,
    source: Option<&'a mut (dyn BackupSource + 'a)>,
) -> Result<VerifySummary, Error> {
    let _lock = repo.lock_exclusive()?;
    let targets: Vec<Revision> = repo
        .revisions()?
        .into_iter()
        .filter(|r| r.is_completed() && r.trust == Trust::Distrusted)
        .collect();
    verify_revisions(repo, &targets, source)
}

/// Like [verify_distrusted] for an explicit revision set. The caller
/// must hold the exclusive repository lock.
pub fn verify_revisions<'a>(
    repo: &Repository,
    targets: &[Revision],
    mut source: Option<&'a mut (dyn BackupSource + 'a)>,
) -> Result<VerifySummary, Error> {
    let deadline = Instant::now() + VERIFY_BUDGET;
    let mut summary = VerifySummary::default();

    for rev in targets {
        match verify_one(repo, rev, source.as_deref_mut(), deadline)? {
            Outcome::Clean => {
                repo.set_trust(&rev.uuid, Trust::Verified)?;
                repo.log_event(&format!("verified {}", rev.uuid));
                summary.verified += 1;
            }
            Outcome::Mismatch => {
                repo.log_event(&format!("verification of {} failed, removing", rev.uuid));
                repo.forget(&rev.uuid)?;
                summary.removed += 1;
            }
            Outcome::OutOfBudget => summary.unfinished += 1,
        }
    }
    if summary.removed > 0 {
        repo.purge()?;
    }
    Ok(summary)
}

enum Outcome {
    Clean,
    Mismatch,
    OutOfBudget,
}

fn verify_one<'a>(
    repo: &Repository,
    rev: &Revision,
    mut source: Option<&mut (dyn BackupSource + 'a)>,
    deadline: Instant,
) -> Result<Outcome, Error> {
    let map = repo.load_map(rev)?;
    for (block, id) in map.iter() {
        if Instant::now() > deadline {
            log::warn!("verification budget exhausted at {}", rev.uuid);
            return Ok(Outcome::OutOfBudget);
        }
        let data = match repo.store().get(id) {
            Ok(data) => data,
            Err(err) if is_integrity_error(&err) => {
                repo.distrust_all()?;
                return Ok(Outcome::Mismatch);
            }
            Err(err) => return Err(err),
        };
        if let Some(src) = source.as_deref_mut() {
            if src.read_block(*block)? != data {
                return Ok(Outcome::Mismatch);
            }
        }
    }
    Ok(Outcome::Clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backy_datastore::revision::RevisionStats;
    use std::collections::BTreeSet;

    fn completed_rev(repo: &Repository, data: &[u8]) -> (Revision, ChunkMap) {
        let mut rev = Revision::new(BTreeSet::new());
        rev.duration = 1.0;
        rev.size = data.len() as u64;
        rev.stats = RevisionStats::default();
        let (id, _) = repo.store().put(data).unwrap();
        let map: ChunkMap = [(0u32, id)].into_iter().collect();
        repo.save_revision(&rev, &map).unwrap();
        (rev, map)
    }

    #[test]
    fn clean_distrusted_revision_gets_verified() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let (rev, _) = completed_rev(&repo, b"intact data");
        repo.distrust_all().unwrap();

        let summary = verify_distrusted(&repo, None).unwrap();
        assert_eq!(summary.verified, 1);
        assert_eq!(summary.removed, 0);
        assert_eq!(
            repo.find(&rev.uuid.parse().unwrap()).unwrap()[0].trust,
            Trust::Verified
        );
        assert!(!repo.store().paranoid());
    }

    #[test]
    fn corrupt_chunk_removes_revision() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let (rev, map) = completed_rev(&repo, b"soon to be corrupted");
        repo.distrust_all().unwrap();

        let id = map.get(0).unwrap();
        let path = repo.store().chunk_path(id);
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x80;
        std::fs::write(&path, raw).unwrap();

        let summary = verify_distrusted(&repo, None).unwrap();
        assert_eq!(summary.removed, 1);
        assert!(repo
            .revisions()
            .unwrap()
            .iter()
            .all(|r| r.uuid != rev.uuid));
    }
}
