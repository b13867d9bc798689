//! Buffer pool
//!
//! Every block touched by a transaction or by recovery lives in one shared
//! buffer. A buffer remembers the last transaction that modified it and the
//! highest LSN describing that change; flushing a buffer first makes the log
//! durable up to that LSN (write-ahead rule).
//!
//! The pool never evicts. Pages reach disk only through the explicit flush
//! operations, which is exactly what the recovery protocol relies on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::error::{GraniteError, Result};
use crate::types::{BlockId, Lsn, TxnId};
use crate::wal::LogManager;
use super::file::FileManager;
use super::page::Page;

/// An in-memory block plus its modification bookkeeping
#[derive(Debug)]
pub struct Buffer {
    block: BlockId,
    page: Page,
    /// Last transaction that changed the page since it was flushed
    modified_by: Option<TxnId>,
    /// Highest log record that must be durable before the page is written
    lsn: Option<Lsn>,
}

impl Buffer {
    fn load(files: &FileManager, block: &BlockId) -> Result<Self> {
        let mut page = Page::new(files.block_size());
        files.read(block, &mut page)?;
        Ok(Self {
            block: block.clone(),
            page,
            modified_by: None,
            lsn: None,
        })
    }

    pub fn block(&self) -> &BlockId {
        &self.block
    }

    pub fn contents(&self) -> &Page {
        &self.page
    }

    pub fn contents_mut(&mut self) -> &mut Page {
        &mut self.page
    }

    /// Record that `txn_id` changed this page. `lsn` is the log record
    /// describing the change, or `None` for changes that were not logged
    /// (undo and redo during recovery).
    pub fn set_modified(&mut self, txn_id: TxnId, lsn: Option<Lsn>) {
        self.modified_by = Some(txn_id);
        if let Some(lsn) = lsn {
            self.lsn = Some(self.lsn.map_or(lsn, |current| current.max(lsn)));
        }
    }

    pub fn modifying_txn(&self) -> Option<TxnId> {
        self.modified_by
    }

    pub fn is_dirty(&self) -> bool {
        self.modified_by.is_some()
    }

    /// Write the page to disk if dirty, forcing the log first
    fn flush(&mut self, files: &FileManager, log: &LogManager) -> Result<bool> {
        if self.modified_by.is_none() {
            return Ok(false);
        }
        if let Some(lsn) = self.lsn {
            log.flush(lsn)?;
        }
        files.write(&self.block, &self.page)?;
        self.modified_by = None;
        Ok(true)
    }
}

/// Shared handle to a pooled buffer
#[derive(Debug, Clone)]
pub struct BufferHandle(Arc<Mutex<Buffer>>);

impl BufferHandle {
    /// Lock the buffer for reading or modification
    pub fn lock(&self) -> Result<MutexGuard<'_, Buffer>> {
        self.0
            .lock()
            .map_err(|_| GraniteError::Internal("buffer lock poisoned".to_string()))
    }
}

/// The shared page cache over a [`FileManager`]
pub struct BufferManager {
    files: Arc<FileManager>,
    log: Arc<LogManager>,
    pool: RwLock<HashMap<BlockId, BufferHandle>>,
}

impl BufferManager {
    pub fn new(files: Arc<FileManager>, log: Arc<LogManager>) -> Self {
        Self {
            files,
            log,
            pool: RwLock::new(HashMap::new()),
        }
    }

    /// Get the buffer for a block, reading it from disk on first use
    pub fn pin(&self, block: &BlockId) -> Result<BufferHandle> {
        {
            let pool = self
                .pool
                .read()
                .map_err(|_| GraniteError::Internal("buffer pool lock poisoned".to_string()))?;
            if let Some(handle) = pool.get(block) {
                return Ok(handle.clone());
            }
        }

        let mut pool = self
            .pool
            .write()
            .map_err(|_| GraniteError::Internal("buffer pool lock poisoned".to_string()))?;
        if let Some(handle) = pool.get(block) {
            return Ok(handle.clone());
        }
        let handle = BufferHandle(Arc::new(Mutex::new(Buffer::load(&self.files, block)?)));
        pool.insert(block.clone(), handle.clone());
        Ok(handle)
    }

    fn buffers(&self) -> Result<Vec<BufferHandle>> {
        let pool = self
            .pool
            .read()
            .map_err(|_| GraniteError::Internal("buffer pool lock poisoned".to_string()))?;
        Ok(pool.values().cloned().collect())
    }

    /// Flush every page last modified by `txn_id`. Returns the number written.
    pub fn flush_all_for(&self, txn_id: TxnId) -> Result<usize> {
        let mut written = 0;
        for handle in self.buffers()? {
            let mut buffer = handle.lock()?;
            if buffer.modifying_txn() == Some(txn_id) && buffer.flush(&self.files, &self.log)? {
                written += 1;
            }
        }
        if written > 0 {
            log::debug!("Flushed {} pages for transaction {}", written, txn_id);
        }
        Ok(written)
    }

    /// Flush every dirty page. Returns the number written.
    pub fn flush_all(&self) -> Result<usize> {
        let mut written = 0;
        for handle in self.buffers()? {
            if handle.lock()?.flush(&self.files, &self.log)? {
                written += 1;
            }
        }
        if written > 0 {
            log::debug!("Flushed {} dirty pages", written);
        }
        Ok(written)
    }

    /// Blocks with changes not yet on disk, in block order
    pub fn dirty_blocks(&self) -> Result<Vec<BlockId>> {
        let mut blocks = Vec::new();
        for handle in self.buffers()? {
            let buffer = handle.lock()?;
            if buffer.is_dirty() {
                blocks.push(buffer.block().clone());
            }
        }
        blocks.sort();
        Ok(blocks)
    }
}
