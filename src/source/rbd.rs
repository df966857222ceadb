use std::collections::BTreeSet;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, format_err, Error};
use serde::Deserialize;

use backy_datastore::revision::Revision;
use backy_datastore::CHUNK_SIZE;

use super::{command_output, command_output_timeout, BackupSource, BlockSelection, READY_TIMEOUT};

/// Snapshots created by us carry this prefix plus the revision uuid,
/// which is how the next run finds its diff base.
const SNAP_PREFIX: &str = "backy-";

/// Ceph RBD image, driven through the `rbd` CLI: snapshot for a
/// consistent view, `rbd diff` for changed blocks, a mapped snapshot
/// device for reading.
pub struct RbdSource {
    pool: String,
    image: String,
    full_always: bool,
    snapshot: Option<String>,
    device: Option<MappedDevice>,
    size: Option<u64>,
}

struct MappedDevice {
    path: PathBuf,
    file: File,
}

#[derive(Deserialize)]
struct RbdInfo {
    size: u64,
}

#[derive(Deserialize)]
struct RbdSnap {
    name: String,
}

/// One entry of `rbd diff --format json`. The `exists` flag is
/// ignored: re-reading a discarded extent yields zeroes and records a
/// hole, which is exactly right.
#[derive(Deserialize)]
struct RbdDiffExtent {
    offset: u64,
    length: u64,
}

impl RbdSource {
    pub fn new(pool: String, image: String, full_always: bool) -> Self {
        RbdSource {
            pool,
            image,
            full_always,
            snapshot: None,
            device: None,
            size: None,
        }
    }

    fn image_spec(&self) -> String {
        format!("{}/{}", self.pool, self.image)
    }

    fn snap_spec(&self, snap: &str) -> String {
        format!("{}/{}@{}", self.pool, self.image, snap)
    }

    fn rbd(&self, args: &[&str]) -> Result<Vec<u8>, Error> {
        command_output(Command::new("rbd").args(args))
    }

    fn list_snapshots(&self) -> Result<Vec<String>, Error> {
        let raw = self.rbd(&["snap", "ls", "--format", "json", &self.image_spec()])?;
        let snaps: Vec<RbdSnap> = serde_json::from_slice(&raw)
            .map_err(|err| format_err!("unparseable 'rbd snap ls' output - {err}"))?;
        Ok(snaps.into_iter().map(|s| s.name).collect())
    }

    fn current_snapshot(&self) -> Result<&str, Error> {
        self.snapshot
            .as_deref()
            .ok_or_else(|| format_err!("no active snapshot on {}", self.image_spec()))
    }

    /// Removes all backy snapshots except `keep`.
    fn remove_stale_snapshots(&self, keep: Option<&str>) -> Result<(), Error> {
        let mut first_err = None;
        for snap in self.list_snapshots()? {
            if !snap.starts_with(SNAP_PREFIX) || Some(snap.as_str()) == keep {
                continue;
            }
            if let Err(err) = self.rbd(&["snap", "rm", &self.snap_spec(&snap)]) {
                log::warn!("cannot remove snapshot {snap}: {err}");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl BackupSource for RbdSource {
    fn size(&mut self) -> Result<u64, Error> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let spec = match &self.snapshot {
            Some(snap) => self.snap_spec(snap),
            None => self.image_spec(),
        };
        let raw = self.rbd(&["info", "--format", "json", &spec])?;
        let info: RbdInfo = serde_json::from_slice(&raw)
            .map_err(|err| format_err!("unparseable 'rbd info' output - {err}"))?;
        self.size = Some(info.size);
        Ok(info.size)
    }

    fn ready(&mut self) -> Result<(), Error> {
        let spec = self.image_spec();
        command_output_timeout(
            Command::new("rbd").args(["info", "--format", "json", &spec]),
            READY_TIMEOUT,
        )?;
        Ok(())
    }

    fn snapshot_begin(&mut self, rev_uuid: &str) -> Result<(), Error> {
        if self.snapshot.is_some() {
            bail!("snapshot scope on {} is already open", self.image_spec());
        }
        let snap = format!("{SNAP_PREFIX}{rev_uuid}");
        self.rbd(&["snap", "create", &self.snap_spec(&snap)])?;

        let mapped = match self.rbd(&["map", "--read-only", &self.snap_spec(&snap)]) {
            Ok(out) => PathBuf::from(String::from_utf8_lossy(&out).trim()),
            Err(err) => {
                let _ = self.rbd(&["snap", "rm", &self.snap_spec(&snap)]);
                return Err(err);
            }
        };
        let file = match File::open(&mapped) {
            Ok(file) => file,
            Err(err) => {
                let _ = self.rbd(&["unmap", &mapped.to_string_lossy()]);
                let _ = self.rbd(&["snap", "rm", &self.snap_spec(&snap)]);
                return Err(format_err!("mapped device {mapped:?} is not readable - {err}"));
            }
        };
        self.snapshot = Some(snap);
        self.device = Some(MappedDevice { path: mapped, file });
        Ok(())
    }

    fn snapshot_end(&mut self, commit: bool) -> Result<(), Error> {
        let snap = match self.snapshot.take() {
            Some(snap) => snap,
            None => return Ok(()),
        };
        self.size = None;

        let mut first_err = None;
        if let Some(device) = self.device.take() {
            drop(device.file);
            if let Err(err) = self.rbd(&["unmap", &device.path.to_string_lossy()]) {
                log::warn!("cannot unmap {:?}: {err}", device.path);
                first_err.get_or_insert(err);
            }
        }
        let res = if commit {
            // the fresh snapshot stays around as the next diff base
            self.remove_stale_snapshots(Some(&snap))
        } else {
            self.rbd(&["snap", "rm", &self.snap_spec(&snap)]).map(|_| ())
        };
        if let Err(err) = res {
            first_err.get_or_insert(err);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn blocks_to_examine(&mut self, parent: Option<&Revision>) -> Result<BlockSelection, Error> {
        let snap = self.current_snapshot()?.to_string();
        if self.full_always {
            return Ok(BlockSelection::All);
        }
        let parent = match parent {
            Some(parent) => parent,
            None => return Ok(BlockSelection::All),
        };

        let parent_snap = format!("{SNAP_PREFIX}{}", parent.uuid);
        if !self.list_snapshots()?.contains(&parent_snap) {
            log::info!(
                "{}: diff base {parent_snap} is gone, examining everything",
                self.image_spec()
            );
            return Ok(BlockSelection::All);
        }

        let raw = self.rbd(&[
            "diff",
            "--format",
            "json",
            "--from-snap",
            &parent_snap,
            &self.snap_spec(&snap),
        ])?;
        let extents: Vec<RbdDiffExtent> = serde_json::from_slice(&raw)
            .map_err(|err| format_err!("unparseable 'rbd diff' output - {err}"))?;

        let mut blocks = BTreeSet::new();
        for extent in extents {
            if extent.length == 0 {
                continue;
            }
            let first = extent.offset / CHUNK_SIZE as u64;
            let last = (extent.offset + extent.length - 1) / CHUNK_SIZE as u64;
            blocks.extend(first as u32..=last as u32);
        }
        Ok(BlockSelection::These(blocks))
    }

    fn read_block(&mut self, block: u32) -> Result<Vec<u8>, Error> {
        let size = self.size()?;
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| format_err!("no mapped snapshot on {}", self.image_spec()))?;

        let offset = block as u64 * CHUNK_SIZE as u64;
        let want = (size.saturating_sub(offset) as usize).min(CHUNK_SIZE);
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < buf.len() {
            match device.file.read_at(&mut buf[filled..], offset + filled as u64)? {
                0 => break,
                n => filled += n,
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}
