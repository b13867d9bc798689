//! Block-addressed data files
//!
//! Each data file is a sequence of `block_size` blocks. Reads past the end
//! of a file return a zeroed page; writes extend the file as needed and are
//! synced before returning, so a flushed page survives a crash.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{GraniteError, Result};
use crate::types::BlockId;
use super::page::Page;

/// Reads and writes pages of the data files under one directory
pub struct FileManager {
    /// Directory holding the data files
    dir: PathBuf,
    block_size: usize,
    /// Open handles by file name
    open_files: Mutex<HashMap<String, File>>,
}

impl FileManager {
    pub fn new(dir: PathBuf, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(GraniteError::Config("block size must be positive".to_string()));
        }
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            block_size,
            open_files: Mutex::new(HashMap::new()),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn with_file<T>(&self, name: &str, f: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let mut files = self
            .open_files
            .lock()
            .map_err(|_| GraniteError::Internal("file table lock poisoned".to_string()))?;
        if !files.contains_key(name) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(self.dir.join(name))?;
            files.insert(name.to_string(), file);
        }
        match files.get_mut(name) {
            Some(file) => f(file),
            None => Err(GraniteError::Internal(format!("file {} vanished from table", name))),
        }
    }

    /// Read a block into `page`. Missing bytes beyond the end of file read as zero.
    pub fn read(&self, blk: &BlockId, page: &mut Page) -> Result<()> {
        let block_size = self.block_size as u64;
        self.with_file(&blk.file, |file| {
            let offset = blk.number * block_size;
            let len = file.metadata()?.len();
            let buf = page.contents_mut();
            buf.fill(0);
            if offset >= len {
                return Ok(());
            }
            let available = ((len - offset).min(block_size)) as usize;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf[..available])?;
            Ok(())
        })
    }

    /// Write a page to its block and sync the file
    pub fn write(&self, blk: &BlockId, page: &Page) -> Result<()> {
        if page.size() != self.block_size {
            return Err(GraniteError::Page(format!(
                "page of {} bytes does not match block size {}",
                page.size(),
                self.block_size
            )));
        }
        let block_size = self.block_size as u64;
        self.with_file(&blk.file, |file| {
            file.seek(SeekFrom::Start(blk.number * block_size))?;
            file.write_all(page.contents())?;
            file.sync_data()?;
            Ok(())
        })
    }
}
