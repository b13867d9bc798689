//! Transaction handle
//!
//! Wraps a [`RecoveryManager`] with the page access a client needs: every
//! change is logged first, then applied to the shared buffer, and the buffer
//! remembers the LSN so it cannot reach disk ahead of its log record.

use std::sync::Arc;

use crate::error::Result;
use crate::recovery::{CancelToken, CheckpointOutcome, RecoveryManager};
use crate::storage::BufferManager;
use crate::types::{BlockId, Lsn, TxnId, TxnState};

/// A running transaction. Dropping an active transaction neither commits
/// nor rolls it back; recovery treats it as incomplete.
pub struct Transaction {
    recovery: RecoveryManager,
    buffers: Arc<BufferManager>,
}

impl Transaction {
    pub(crate) fn new(recovery: RecoveryManager) -> Self {
        let buffers = Arc::clone(&recovery.context().buffers);
        Self { recovery, buffers }
    }

    pub fn id(&self) -> TxnId {
        self.recovery.txn_id()
    }

    pub fn state(&self) -> TxnState {
        self.recovery.state()
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn get_int(&self, block: &BlockId, offset: usize) -> Result<i32> {
        let handle = self.buffers.pin(block)?;
        let buffer = handle.lock()?;
        buffer.contents().get_int(offset)
    }

    pub fn get_string(&self, block: &BlockId, offset: usize) -> Result<String> {
        let handle = self.buffers.pin(block)?;
        let buffer = handle.lock()?;
        buffer.contents().get_string(offset)
    }

    pub fn set_int(&self, block: &BlockId, offset: usize, value: i32) -> Result<Lsn> {
        let handle = self.buffers.pin(block)?;
        let mut buffer = handle.lock()?;
        let lsn = self.recovery.set_int(&buffer, offset, value)?;
        buffer.contents_mut().set_int(offset, value)?;
        buffer.set_modified(self.id(), Some(lsn));
        Ok(lsn)
    }

    pub fn set_string(&self, block: &BlockId, offset: usize, value: &str) -> Result<Lsn> {
        let handle = self.buffers.pin(block)?;
        let mut buffer = handle.lock()?;
        let lsn = self.recovery.set_string(&buffer, offset, value)?;
        buffer.contents_mut().set_string(offset, value)?;
        buffer.set_modified(self.id(), Some(lsn));
        Ok(lsn)
    }

    pub fn commit(&mut self) -> Result<Lsn> {
        self.recovery.commit()
    }

    pub fn rollback(&mut self) -> Result<Lsn> {
        self.recovery.rollback()
    }

    /// Run a non-quiescent checkpoint coordinated by this transaction
    pub fn checkpoint(&self, cancel: &CancelToken) -> Result<CheckpointOutcome> {
        self.recovery.checkpoint(cancel)
    }
}
