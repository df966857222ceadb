//! Source adapters: how a job reads the volume it backs up.
//!
//! An adapter only has to enumerate a *superset* of the blocks that
//! changed since the parent revision; the backup driver re-reads and
//! content-addresses whatever is enumerated, so over-reporting costs
//! I/O but never correctness.

use std::collections::BTreeSet;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};

use backy_datastore::revision::Revision;

use crate::config::SourceSpec;

mod file;
mod rbd;
mod quiesce;

pub use file::FileSource;
pub use rbd::RbdSource;
pub use quiesce::QuiescedRbdSource;

/// Budget for the fast [BackupSource::ready] probe.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Which blocks a backup run has to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSelection {
    All,
    These(BTreeSet<u32>),
}

pub trait BackupSource: Send {
    /// Logical size of the volume in bytes.
    fn size(&mut self) -> Result<u64, Error>;

    /// Fast reachability probe. A failure here is transient from the
    /// scheduler's point of view and only triggers backoff.
    fn ready(&mut self) -> Result<(), Error>;

    /// Enters a consistent view of the source, named after the
    /// revision in progress. The default is a no-op for sources that
    /// cannot snapshot.
    fn snapshot_begin(&mut self, _rev_uuid: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Leaves the snapshot scope. With `commit` the view is kept
    /// around as the diff base of the next run; without, it is
    /// discarded. Called on every exit path of a backup.
    fn snapshot_end(&mut self, _commit: bool) -> Result<(), Error> {
        Ok(())
    }

    /// Blocks to examine relative to `parent`. Any superset of the
    /// actually changed blocks is correct.
    fn blocks_to_examine(&mut self, parent: Option<&Revision>) -> Result<BlockSelection, Error>;

    /// Reads up to [CHUNK_SIZE](backy_datastore::CHUNK_SIZE) bytes at
    /// block `block`; shorter only at end of volume.
    fn read_block(&mut self, block: u32) -> Result<Vec<u8>, Error>;
}

pub fn open(spec: &SourceSpec) -> Box<dyn BackupSource> {
    match spec {
        SourceSpec::File { filename } => Box::new(FileSource::new(filename.clone())),
        SourceSpec::CephRbd {
            pool,
            image,
            full_always,
        } => Box::new(RbdSource::new(pool.clone(), image.clone(), *full_always)),
        SourceSpec::QuiescedRbd {
            pool,
            image,
            freeze_command,
            thaw_command,
            full_always,
        } => Box::new(QuiescedRbdSource::new(
            RbdSource::new(pool.clone(), image.clone(), *full_always),
            freeze_command.clone(),
            thaw_command.clone(),
        )),
    }
}

/// Runs a command to completion and returns its stdout. Non-zero exit
/// status becomes an error carrying the command line and stderr.
pub(crate) fn command_output(cmd: &mut Command) -> Result<Vec<u8>, Error> {
    let rendered = render(cmd);
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|err| format_err!("failed to run '{rendered}' - {err}"))?;
    if !output.status.success() {
        bail!(
            "'{rendered}' failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

/// Like [command_output] but with a deadline, for probes that must not
/// hang the scheduler. Only suitable for commands with small output.
pub(crate) fn command_output_timeout(
    cmd: &mut Command,
    timeout: Duration,
) -> Result<Vec<u8>, Error> {
    use std::io::Read;

    let rendered = render(cmd);
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| format_err!("failed to run '{rendered}' - {err}"))?;

    let started = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if started.elapsed() > timeout => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("'{rendered}' timed out after {timeout:?}");
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    };

    let mut stdout = Vec::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_end(&mut stdout)?;
    }
    if !status.success() {
        let mut stderr = Vec::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_end(&mut stderr);
        }
        bail!(
            "'{rendered}' failed ({status}): {}",
            String::from_utf8_lossy(&stderr).trim()
        );
    }
    Ok(stdout)
}

fn render(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
