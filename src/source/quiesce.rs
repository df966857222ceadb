use std::process::Command;

use anyhow::{format_err, Error};

use backy_datastore::revision::Revision;

use super::{command_output, BackupSource, BlockSelection, RbdSource};

/// RBD source for virtualised guests: the guest filesystem is frozen
/// with an external command for the instant the snapshot is taken, so
/// the image is crash-consistent at worst and clean at best.
///
/// The freeze window only spans snapshot creation; reads happen from
/// the snapshot afterwards, with the guest running again.
pub struct QuiescedRbdSource {
    inner: RbdSource,
    freeze_command: String,
    thaw_command: String,
}

impl QuiescedRbdSource {
    pub fn new(inner: RbdSource, freeze_command: String, thaw_command: String) -> Self {
        QuiescedRbdSource {
            inner,
            freeze_command,
            thaw_command,
        }
    }

    fn shell(command: &str) -> Result<(), Error> {
        command_output(Command::new("sh").args(["-c", command]))
            .map_err(|err| format_err!("quiesce command failed: {err}"))?;
        Ok(())
    }
}

impl BackupSource for QuiescedRbdSource {
    fn size(&mut self) -> Result<u64, Error> {
        self.inner.size()
    }

    fn ready(&mut self) -> Result<(), Error> {
        self.inner.ready()
    }

    fn snapshot_begin(&mut self, rev_uuid: &str) -> Result<(), Error> {
        Self::shell(&self.freeze_command)?;
        let result = self.inner.snapshot_begin(rev_uuid);
        // thaw no matter whether the snapshot worked; a guest left
        // frozen is worse than a skipped backup
        if let Err(err) = Self::shell(&self.thaw_command) {
            log::error!("thaw failed, guest may still be frozen: {err}");
            if result.is_ok() {
                let _ = self.inner.snapshot_end(false);
                return Err(err);
            }
        }
        result
    }

    fn snapshot_end(&mut self, commit: bool) -> Result<(), Error> {
        self.inner.snapshot_end(commit)
    }

    fn blocks_to_examine(&mut self, parent: Option<&Revision>) -> Result<BlockSelection, Error> {
        self.inner.blocks_to_examine(parent)
    }

    fn read_block(&mut self, block: u32) -> Result<Vec<u8>, Error> {
        self.inner.read_block(block)
    }
}
