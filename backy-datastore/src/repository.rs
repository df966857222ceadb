use std::collections::{BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};
use chrono::Utc;
use fs2::FileExt;

use crate::chunk_map::ChunkMap;
use crate::chunk_store::ChunkStore;
use crate::prune::{self, Schedule};
use crate::revision::{Revision, RevisionSpec};
use crate::{ChunkId, StoreError, Trust};

pub const LOCK_FILE: &str = ".backy.lock";
const LOG_FILE: &str = "backy.log";
const QUARANTINE_DIR: &str = "quarantine";

/// Returns true when `err` is a chunk integrity failure, the one error
/// that taints every revision of a repository.
pub fn is_integrity_error(err: &Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Integrity { .. })
    )
}

/// Held while an operation owns the repository flock. Dropping the
/// guard releases the lock on every exit path.
#[derive(Debug)]
pub struct RepoLock {
    _file: File,
}

/// One backup history: a directory of revisions plus the chunk store
/// they reference.
pub struct Repository {
    path: PathBuf,
    store: ChunkStore,
}

impl Repository {
    /// Opens (or initializes) the repository at `path`. Paranoid mode
    /// is re-derived from the persisted trust markers, so it survives
    /// process restarts.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let path = path.into();
        std::fs::create_dir_all(path.join(QUARANTINE_DIR))
            .map_err(|err| format_err!("unable to create repository {path:?} - {err}"))?;
        let store = ChunkStore::open(&path)?;
        let repo = Repository { path, store };
        repo.store.set_paranoid(repo.has_distrusted()?);
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    fn lock_file(&self) -> Result<File, Error> {
        let path = self.path.join(LOCK_FILE);
        OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|err| format_err!("unable to open lock file {path:?} - {err}"))
    }

    /// Exclusive lock for mutating operations (backup, expire, purge,
    /// forget, verify, tag edits). Non-blocking; an occupied lock is
    /// an immediate [StoreError::LockHeld].
    pub fn lock_exclusive(&self) -> Result<RepoLock, Error> {
        let file = self.lock_file()?;
        file.try_lock_exclusive().map_err(|_| StoreError::LockHeld {
            path: self.path.join(LOCK_FILE),
        })?;
        Ok(RepoLock { _file: file })
    }

    /// Shared lock for readers (status, restore).
    pub fn lock_shared(&self) -> Result<RepoLock, Error> {
        let file = self.lock_file()?;
        file.try_lock_shared().map_err(|_| StoreError::LockHeld {
            path: self.path.join(LOCK_FILE),
        })?;
        Ok(RepoLock { _file: file })
    }

    /// All revisions, oldest first. The newest completed entry is the
    /// parent of the next backup; there is no stored parent link.
    pub fn revisions(&self) -> Result<Vec<Revision>, Error> {
        let mut revisions = Vec::new();
        for entry in std::fs::read_dir(&self.path)
            .map_err(|err| format_err!("unable to list repository {:?} - {err}", self.path))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(_uuid) = name.strip_suffix(".rev") {
                revisions.push(Revision::load(&entry.path())?);
            }
        }
        revisions.sort_by(|a, b| (a.timestamp, &a.uuid).cmp(&(b.timestamp, &b.uuid)));
        Ok(revisions)
    }

    pub fn newest_completed(&self) -> Result<Option<Revision>, Error> {
        Ok(self
            .revisions()?
            .into_iter()
            .rev()
            .find(|r| r.is_completed()))
    }

    pub fn find(&self, spec: &RevisionSpec) -> Result<Vec<Revision>, Error> {
        let revisions = self.revisions()?;
        Ok(spec.resolve(&revisions)?.into_iter().cloned().collect())
    }

    pub fn load_map(&self, rev: &Revision) -> Result<ChunkMap, Error> {
        ChunkMap::load(&rev.map_path(&self.path))
            .with_context(|| format!("loading chunk map of revision {}", rev.uuid))
    }

    /// Persists a revision: map first, then metadata, so that a `.rev`
    /// file on disk never references a missing map.
    pub fn save_revision(&self, rev: &Revision, map: &ChunkMap) -> Result<(), Error> {
        map.save(&rev.map_path(&self.path))?;
        rev.save(&self.path)
    }

    /// Removes a revision's metadata and map files.
    pub fn forget(&self, uuid: &str) -> Result<(), Error> {
        let rev_path = self.path.join(format!("{uuid}.rev"));
        std::fs::remove_file(&rev_path)
            .map_err(|err| format_err!("unable to remove {rev_path:?} - {err}"))?;
        match std::fs::remove_file(self.path.join(uuid)) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                return Err(format_err!("unable to remove chunk map of {uuid} - {err}"));
            }
            _ => {}
        }
        self.log_event(&format!("forget {uuid}"));
        Ok(())
    }

    /// Best-effort cleanup of an aborted backup. Orphaned chunks stay
    /// behind for the next purge.
    pub fn discard_partial(&self, rev: &Revision) {
        let _ = std::fs::remove_file(rev.rev_path(&self.path));
        let _ = std::fs::remove_file(rev.map_path(&self.path));
    }

    pub fn has_distrusted(&self) -> Result<bool, Error> {
        Ok(self
            .revisions()?
            .iter()
            .any(|r| r.trust == Trust::Distrusted))
    }

    /// Marks every revision distrusted and flips the chunk store into
    /// paranoid mode. Called on the first integrity error.
    pub fn distrust_all(&self) -> Result<(), Error> {
        for mut rev in self.revisions()? {
            if rev.trust != Trust::Distrusted {
                rev.trust = Trust::Distrusted;
                rev.save(&self.path)?;
            }
        }
        self.store.set_paranoid(true);
        self.log_event("distrusting all revisions after integrity error");
        log::warn!("{:?}: all revisions marked distrusted", self.path);
        Ok(())
    }

    pub fn set_trust(&self, uuid: &str, trust: Trust) -> Result<(), Error> {
        let mut revisions = self.revisions()?;
        let rev = revisions
            .iter_mut()
            .find(|r| r.uuid == uuid)
            .ok_or_else(|| format_err!("no revision {uuid}"))?;
        rev.trust = trust;
        rev.save(&self.path)?;
        self.store.set_paranoid(self.has_distrusted()?);
        Ok(())
    }

    /// Chunk ids referenced by any revision, the live set for purge.
    pub fn live_chunks(&self) -> Result<HashSet<ChunkId>, Error> {
        let mut live = HashSet::new();
        for rev in self.revisions()? {
            match self.load_map(&rev) {
                Ok(map) => live.extend(map.ids().copied()),
                // a metadata-only revision in creation has no map yet
                Err(err) if rev.is_completed() => return Err(err),
                Err(_) => {}
            }
        }
        Ok(live)
    }

    /// Removes every chunk no revision references.
    pub fn purge(&self) -> Result<u64, Error> {
        let live = self.live_chunks()?;
        self.store.purge(&live)
    }

    /// Applies tag expiry per the schedule, forgets revisions whose tag
    /// set emptied, then collects orphaned chunks. Returns the uuids of
    /// removed revisions.
    pub fn expire(&self, schedule: &Schedule) -> Result<Vec<String>, Error> {
        let _lock = self.lock_exclusive()?;
        let revisions = self.revisions()?;
        let changes = prune::expire(&revisions, schedule);
        let mut removed = Vec::new();
        for change in changes {
            let mut rev = match revisions.iter().find(|r| r.uuid == change.uuid) {
                Some(rev) => rev.clone(),
                None => continue,
            };
            for tag in &change.remove_tags {
                rev.tags.remove(tag);
            }
            if rev.tags.is_empty() {
                self.forget(&rev.uuid)?;
                removed.push(rev.uuid);
            } else {
                rev.save(&self.path)?;
            }
        }
        if !removed.is_empty() {
            self.log_event(&format!("expired revisions: {}", removed.join(", ")));
        }
        self.purge()?;
        Ok(removed)
    }

    pub fn add_tags(&self, spec: &RevisionSpec, tags: &BTreeSet<String>) -> Result<(), Error> {
        self.edit_tags(spec, |set| set.extend(tags.iter().cloned()))
    }

    pub fn remove_tags(&self, spec: &RevisionSpec, tags: &BTreeSet<String>) -> Result<(), Error> {
        self.edit_tags(spec, |set| set.retain(|t| !tags.contains(t)))
    }

    fn edit_tags<F: Fn(&mut BTreeSet<String>)>(
        &self,
        spec: &RevisionSpec,
        edit: F,
    ) -> Result<(), Error> {
        for mut rev in self.find(spec)? {
            edit(&mut rev.tags);
            rev.save(&self.path)?;
        }
        Ok(())
    }

    /// Preserves source bytes that contradicted a verification re-read.
    /// Forensic only; nothing ever reads these back.
    pub fn quarantine(&self, id: &ChunkId, data: &[u8]) -> Result<PathBuf, Error> {
        let path = self.path.join(QUARANTINE_DIR).join(id.to_string());
        std::fs::write(&path, data)
            .map_err(|err| format_err!("unable to quarantine chunk {id} - {err}"))?;
        self.log_event(&format!("quarantined mismatching chunk {id}"));
        Ok(path)
    }

    /// Appends a timestamped line to the per-repository log. Losing a
    /// line is not worth failing an operation over.
    pub fn log_event(&self, msg: &str) {
        let line = format!("{} {}\n", Utc::now().to_rfc3339(), msg);
        let res = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.join(LOG_FILE))
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(err) = res {
            log::warn!("{:?}: cannot append to {LOG_FILE}: {err}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::prune::Rule;

    fn repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        (dir, repo)
    }

    fn completed_rev(repo: &Repository, age_hours: i64, tags: &[&str], data: &[u8]) -> Revision {
        let mut rev = Revision::new(tags.iter().map(|t| t.to_string()).collect());
        rev.timestamp = Utc::now() - Duration::hours(age_hours);
        rev.duration = 1.0;
        rev.size = data.len() as u64;
        let (id, _) = repo.store().put(data).unwrap();
        let map: ChunkMap = [(0u32, id)].into_iter().collect();
        repo.save_revision(&rev, &map).unwrap();
        rev
    }

    #[test]
    fn lock_exclusivity() {
        let (dir, repo) = repo();
        let other = Repository::open(dir.path()).unwrap();

        let guard = repo.lock_exclusive().unwrap();
        let err = other.lock_exclusive().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::LockHeld { .. })
        ));
        drop(guard);
        other.lock_exclusive().unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let (dir, repo) = repo();
        let other = Repository::open(dir.path()).unwrap();
        let _a = repo.lock_shared().unwrap();
        let _b = other.lock_shared().unwrap();
        assert!(repo.lock_exclusive().is_err());
    }

    #[test]
    fn revisions_sorted_and_parent_found() {
        let (_dir, repo) = repo();
        completed_rev(&repo, 5, &["daily"], b"old");
        let newest = completed_rev(&repo, 1, &["daily"], b"new");

        let revs = repo.revisions().unwrap();
        assert_eq!(revs.len(), 2);
        assert!(revs[0].timestamp < revs[1].timestamp);
        assert_eq!(repo.newest_completed().unwrap().unwrap().uuid, newest.uuid);
    }

    #[test]
    fn forget_removes_both_files() {
        let (_dir, repo) = repo();
        let rev = completed_rev(&repo, 1, &["daily"], b"bye");
        assert!(rev.rev_path(repo.path()).exists());
        repo.forget(&rev.uuid).unwrap();
        assert!(!rev.rev_path(repo.path()).exists());
        assert!(!rev.map_path(repo.path()).exists());
    }

    #[test]
    fn distrust_all_enables_paranoia() {
        let (_dir, repo) = repo();
        completed_rev(&repo, 1, &["daily"], b"data");
        assert!(!repo.store().paranoid());

        repo.distrust_all().unwrap();
        assert!(repo.store().paranoid());
        assert!(repo
            .revisions()
            .unwrap()
            .iter()
            .all(|r| r.trust == Trust::Distrusted));
    }

    #[test]
    fn paranoia_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repo = Repository::open(dir.path()).unwrap();
            completed_rev(&repo, 1, &["daily"], b"data");
            repo.distrust_all().unwrap();
        }
        let repo = Repository::open(dir.path()).unwrap();
        assert!(repo.store().paranoid());
    }

    #[test]
    fn expire_forgets_and_purges() {
        let (_dir, repo) = repo();
        let schedule = Schedule::new(vec![Rule {
            tag: "daily".into(),
            interval: Duration::days(1),
            keep: 2,
        }]);
        let old = completed_rev(&repo, 72, &["daily"], b"ancient bytes");
        completed_rev(&repo, 48, &["daily"], b"middle bytes");
        completed_rev(&repo, 24, &["daily"], b"recent bytes");
        let old_chunk = *repo.load_map(&old).unwrap().get(0).unwrap();

        let removed = repo.expire(&schedule).unwrap();
        assert_eq!(removed, vec![old.uuid.clone()]);
        assert_eq!(repo.revisions().unwrap().len(), 2);
        // the chunk only the expired revision referenced is gone
        assert!(!repo.store().contains(&old_chunk));
    }

    #[test]
    fn tag_edits() {
        let (_dir, repo) = repo();
        let rev = completed_rev(&repo, 1, &["daily"], b"data");
        let spec: RevisionSpec = rev.uuid.parse().unwrap();

        repo.add_tags(&spec, &["manual:keep".to_string()].into())
            .unwrap();
        assert!(repo.find(&spec).unwrap()[0].tags.contains("manual:keep"));

        repo.remove_tags(&spec, &["daily".to_string()].into()).unwrap();
        assert!(!repo.find(&spec).unwrap()[0].tags.contains("daily"));
    }
}
