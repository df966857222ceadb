use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, format_err, Context, Error};

use crate::{ChunkId, StoreError, CHUNK_SIZE};

/// Version tag inside `chunks/store`. Readers refuse stores with an
/// unknown tag instead of guessing at the layout.
const STORE_VERSION: &str = "v2";

const CHUNK_SUFFIX: &str = ".chunk.lzo";

/// Unlinks during a sweep are bundled so that directory metadata is
/// flushed once per bundle instead of once per chunk.
const UNLINK_BATCH: usize = 1024;

/// File system based chunk store: one directory of LZO compressed,
/// content addressed chunk files, plus an in-memory id index.
pub struct ChunkStore {
    chunk_dir: PathBuf,
    index: Mutex<HashSet<ChunkId>>,
    /// While any revision of the owning repository is distrusted, every
    /// write hits the disk and is read back for verification.
    paranoid: AtomicBool,
    mutex: Mutex<()>,
}

impl ChunkStore {
    fn chunk_dir<P: AsRef<Path>>(base: P) -> PathBuf {
        base.as_ref().join("chunks")
    }

    /// Opens (or initializes) the chunk store below `base`, scanning
    /// the tree to populate the id index.
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self, Error> {
        let chunk_dir = Self::chunk_dir(&base);
        std::fs::create_dir_all(&chunk_dir)
            .map_err(|err| format_err!("unable to create chunk dir {chunk_dir:?} - {err}"))?;

        let tag_path = chunk_dir.join("store");
        match std::fs::read_to_string(&tag_path) {
            Ok(tag) => {
                if tag.trim() != STORE_VERSION {
                    bail!(
                        "unsupported chunk store version '{}' in {tag_path:?} (expected {STORE_VERSION})",
                        tag.trim()
                    );
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                std::fs::write(&tag_path, STORE_VERSION)
                    .map_err(|err| format_err!("unable to write {tag_path:?} - {err}"))?;
            }
            Err(err) => bail!("unable to read {tag_path:?} - {err}"),
        }

        let store = ChunkStore {
            chunk_dir,
            index: Mutex::new(HashSet::new()),
            paranoid: AtomicBool::new(false),
            mutex: Mutex::new(()),
        };
        store.scan()?;
        Ok(store)
    }

    pub fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        let mut path = self.chunk_dir.join(id.prefix());
        path.push(format!("{id}{CHUNK_SUFFIX}"));
        path
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.index.lock().unwrap().contains(id)
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().unwrap().is_empty()
    }

    pub fn set_paranoid(&self, on: bool) {
        self.paranoid.store(on, Ordering::Relaxed);
    }

    pub fn paranoid(&self) -> bool {
        self.paranoid.load(Ordering::Relaxed)
    }

    /// Stores `data` under its content address. Returns the id and
    /// whether the chunk already existed (i.e. no bytes were written).
    ///
    /// The write path compresses into a temp file next to the final
    /// location, fsyncs and renames. Two racing writers of the same id
    /// both rename to the same name; the loser's data is identical, so
    /// either outcome leaves exactly one valid file.
    pub fn put(&self, data: &[u8]) -> Result<(ChunkId, bool), Error> {
        let id = ChunkId::digest(data);
        let existed = self.insert(data, &id)?;
        Ok((id, existed))
    }

    /// Like [put](Self::put) with a caller-computed id.
    pub fn insert(&self, data: &[u8], id: &ChunkId) -> Result<bool, Error> {
        if data.len() > CHUNK_SIZE {
            bail!("chunk exceeds maximum size ({} > {CHUNK_SIZE})", data.len());
        }

        let paranoid = self.paranoid();
        if !paranoid && self.contains(id) {
            return Ok(true);
        }

        let chunk_path = self.chunk_path(id);
        let dir_path = chunk_path
            .parent()
            .ok_or_else(|| format_err!("unable to get chunk dir of {chunk_path:?}"))?;
        std::fs::create_dir_all(dir_path)?;

        let compressed = minilzo::compress(data)
            .map_err(|err| format_err!("compressing chunk {id} failed - {err:?}"))?;

        let _guard = self.mutex.lock().unwrap();

        // pid-suffixed temp name: racing writers from two processes
        // never clobber each other's in-flight file
        let tmp_path = chunk_path.with_extension(format!("lzo.tmp{}", std::process::id()));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|err| format_err!("unable to create {tmp_path:?} - {err}"))?;
        if let Err(err) = file
            .write_all(&compressed)
            .and_then(|_| file.sync_all())
            .map_err(Error::from)
            .and_then(|_| {
                std::fs::rename(&tmp_path, &chunk_path)?;
                fsync_dir(dir_path)
            })
        {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(format_err!("inserting chunk {id} failed - {err}"));
        }

        if paranoid {
            drop(_guard);
            self.get(id)
                .map_err(|err| format_err!("post-write verification of chunk {id} failed: {err}"))?;
        }

        self.index.lock().unwrap().insert(*id);
        Ok(false)
    }

    /// Reads and decompresses a chunk. The plaintext is always
    /// re-hashed; a mismatch surfaces as [StoreError::Integrity] and
    /// the caller is expected to distrust the whole repository.
    pub fn get(&self, id: &ChunkId) -> Result<Vec<u8>, Error> {
        let chunk_path = self.chunk_path(id);
        let mut compressed = Vec::new();
        File::open(&chunk_path)
            .and_then(|mut f| f.read_to_end(&mut compressed))
            .map_err(|err| format_err!("unable to read chunk {id} at {chunk_path:?} - {err}"))?;

        let data = minilzo::decompress(&compressed, CHUNK_SIZE)
            .map_err(|err| Error::from(StoreError::Integrity { id: *id }).context(format!(
                "chunk {id} does not decompress - {err:?}"
            )))?;

        if ChunkId::digest(&data) != *id {
            return Err(StoreError::Integrity { id: *id }.into());
        }
        Ok(data)
    }

    /// Rebuilds the in-memory index from disk. Run at open and before a
    /// sweep; also repairs a dropped or partial index and clears temp
    /// files a crashed writer left behind.
    pub fn scan(&self) -> Result<usize, Error> {
        let mut known = HashSet::new();
        for entry in walkdir::WalkDir::new(&self.chunk_dir).min_depth(2).max_depth(2) {
            let entry = entry.with_context(|| format!("scanning {:?}", self.chunk_dir))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            match parse_chunk_name(&name) {
                Some(id) => {
                    known.insert(id);
                }
                None if name.contains(".tmp") => {
                    log::info!("removing stale temp file {:?}", entry.path());
                    let _ = std::fs::remove_file(entry.path());
                }
                None => {}
            }
        }
        let len = known.len();
        *self.index.lock().unwrap() = known;
        Ok(len)
    }

    /// Walks the chunk tree and removes every file whose id is not in
    /// `live`. Returns the number of removed chunks.
    pub fn unlink_unreferenced(&self, live: &HashSet<ChunkId>) -> Result<u64, Error> {
        let mut removed = 0;
        let mut batch: Vec<(PathBuf, ChunkId)> = Vec::with_capacity(UNLINK_BATCH);

        for entry in walkdir::WalkDir::new(&self.chunk_dir).min_depth(2).max_depth(2) {
            let entry = entry.with_context(|| format!("sweeping {:?}", self.chunk_dir))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let id = match parse_chunk_name(&entry.file_name().to_string_lossy()) {
                Some(id) => id,
                None => continue,
            };
            if live.contains(&id) {
                continue;
            }
            batch.push((entry.path().to_owned(), id));
            if batch.len() >= UNLINK_BATCH {
                removed += self.flush_unlink_batch(&mut batch)?;
            }
        }
        removed += self.flush_unlink_batch(&mut batch)?;
        Ok(removed)
    }

    fn flush_unlink_batch(&self, batch: &mut Vec<(PathBuf, ChunkId)>) -> Result<u64, Error> {
        let mut dirs: HashSet<PathBuf> = HashSet::new();
        let mut removed = 0;
        let mut index = self.index.lock().unwrap();
        for (path, id) in batch.drain(..) {
            std::fs::remove_file(&path)
                .map_err(|err| format_err!("unlinking chunk {path:?} failed - {err}"))?;
            index.remove(&id);
            removed += 1;
            if let Some(dir) = path.parent() {
                dirs.insert(dir.to_owned());
            }
        }
        drop(index);
        for dir in dirs {
            fsync_dir(&dir)?;
        }
        Ok(removed)
    }

    /// Reindex, then drop everything unreferenced.
    pub fn purge(&self, live: &HashSet<ChunkId>) -> Result<u64, Error> {
        self.scan()?;
        let removed = self.unlink_unreferenced(live)?;
        if removed > 0 {
            log::info!("purged {removed} unreferenced chunks from {:?}", self.chunk_dir);
        }
        Ok(removed)
    }
}

fn fsync_dir(dir: &Path) -> Result<(), Error> {
    let handle = File::open(dir)?;
    nix::unistd::fsync(handle.as_raw_fd())
        .map_err(|err| format_err!("fsync of {dir:?} failed - {err}"))?;
    Ok(())
}

fn parse_chunk_name(name: &str) -> Option<ChunkId> {
    name.strip_suffix(CHUNK_SUFFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = store();
        let (id, existed) = store.put(b"some block data").unwrap();
        assert!(!existed);
        let (id2, existed) = store.put(b"some block data").unwrap();
        assert_eq!(id, id2);
        assert!(existed);
        // exactly one file on disk
        let files: Vec<_> = walkdir::WalkDir::new(store.chunk_path(&id).parent().unwrap())
            .min_depth(1)
            .into_iter()
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn get_round_trips() {
        let (_dir, store) = store();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let (id, _) = store.put(&data).unwrap();
        assert_eq!(store.get(&id).unwrap(), data);
    }

    #[test]
    fn get_detects_corruption() {
        let (_dir, store) = store();
        let (id, _) = store.put(b"precious bytes that must survive").unwrap();
        let path = store.chunk_path(&id);
        let mut raw = std::fs::read(&path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();

        let err = store.get(&id).unwrap_err();
        assert!(err.downcast_ref::<StoreError>().is_some());
    }

    #[test]
    fn scan_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = ChunkStore::open(dir.path()).unwrap();
            store.put(b"persisted across open").unwrap().0
        };
        let store = ChunkStore::open(dir.path()).unwrap();
        assert!(store.contains(&id));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn refuses_unknown_store_version() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("chunks")).unwrap();
        std::fs::write(dir.path().join("chunks/store"), "v1").unwrap();
        assert!(ChunkStore::open(dir.path()).is_err());
    }

    #[test]
    fn purge_keeps_live_chunks() {
        let (_dir, store) = store();
        let (keep, _) = store.put(b"still referenced").unwrap();
        let (drop_, _) = store.put(b"orphaned").unwrap();

        let live: HashSet<ChunkId> = [keep].into_iter().collect();
        let removed = store.purge(&live).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&keep).is_ok());
        assert!(!store.contains(&drop_));
        assert!(store.get(&drop_).is_err());
    }

    #[test]
    fn paranoid_put_always_writes() {
        let (_dir, store) = store();
        let (id, _) = store.put(b"watched closely").unwrap();
        // drop the file behind the index's back
        std::fs::remove_file(store.chunk_path(&id)).unwrap();

        store.set_paranoid(true);
        let (id2, existed) = store.put(b"watched closely").unwrap();
        assert_eq!(id, id2);
        assert!(!existed);
        assert_eq!(store.get(&id).unwrap(), b"watched closely");
    }

    #[test]
    fn random_data_does_not_collide() {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let mut buf = vec![0u8; 1024];
            rng.fill_bytes(&mut buf);
            assert!(seen.insert(ChunkId::digest(&buf)), "digest collision on random data");
        }
    }
}
