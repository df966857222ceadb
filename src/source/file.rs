use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use anyhow::{format_err, Error};

use backy_datastore::revision::Revision;
use backy_datastore::CHUNK_SIZE;

use super::{BackupSource, BlockSelection};

/// Raw image file or block device. There is no change tracking, so
/// every run examines the whole volume.
pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
}

impl FileSource {
    pub fn new(path: PathBuf) -> Self {
        FileSource { path, file: None }
    }

    fn file(&mut self) -> Result<&File, Error> {
        if self.file.is_none() {
            let file = File::open(&self.path)
                .map_err(|err| format_err!("source {:?} is not readable - {err}", self.path))?;
            self.file = Some(file);
        }
        Ok(self.file.as_ref().expect("just opened"))
    }
}

impl BackupSource for FileSource {
    fn size(&mut self) -> Result<u64, Error> {
        // seek instead of stat so block devices report their real size
        let mut file = self.file()?.try_clone()?;
        Ok(file.seek(SeekFrom::End(0))?)
    }

    fn ready(&mut self) -> Result<(), Error> {
        self.file()?;
        Ok(())
    }

    fn blocks_to_examine(&mut self, _parent: Option<&Revision>) -> Result<BlockSelection, Error> {
        Ok(BlockSelection::All)
    }

    fn read_block(&mut self, block: u32) -> Result<Vec<u8>, Error> {
        let offset = block as u64 * CHUNK_SIZE as u64;
        let file = self.file()?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64)? {
                0 => break, // end of volume
                n => filled += n,
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}
