//! Per-transaction recovery manager
//!
//! Every transaction owns a [`RecoveryManager`]. It writes the transaction's
//! log records and knows how to take the transaction's changes back.
//!
//! ### Lifecycle
//! 1. BEGIN: register the id as active, then log START
//! 2. SETINT/SETSTRING: log the old and new value before the caller changes
//!    the page in the buffer pool
//! 3. COMMIT: log COMMIT and wait until it is durable. Pages are left for
//!    later flushes; redo rebuilds them after a crash.
//! 4. ROLLBACK: walk the log backward undoing this transaction's changes,
//!    flush its pages, then log ROLLBACK durably
//!
//! The write-ahead rule is enforced by the buffer pool: a page never reaches
//! disk before the log record describing its latest change.

use std::sync::Arc;

use crate::error::{GraniteError, Result};
use crate::storage::{Buffer, BufferManager, Page};
use crate::types::{Lsn, TxnId, TxnState};
use crate::wal::LogManager;
use super::checkpoint::{run_checkpoint, CancelToken, CheckpointConfig, CheckpointOutcome};
use super::record::LogRecord;
use super::registry::TransactionRegistry;

/// Shared collaborators every recovery manager works against
#[derive(Clone)]
pub struct RecoveryContext {
    pub log: Arc<LogManager>,
    pub buffers: Arc<BufferManager>,
    pub registry: Arc<TransactionRegistry>,
    pub checkpoint: CheckpointConfig,
}

impl RecoveryContext {
    /// Run a checkpoint that is not driven by any transaction
    pub fn checkpoint(&self, cancel: &CancelToken) -> Result<CheckpointOutcome> {
        run_checkpoint(self, None, cancel)
    }
}

/// Logging, commit and rollback for one transaction
pub struct RecoveryManager {
    txn_id: TxnId,
    ctx: RecoveryContext,
    state: TxnState,
}

impl RecoveryManager {
    /// Start a transaction: register it as active, then log START
    pub fn begin(txn_id: TxnId, ctx: RecoveryContext) -> Result<Self> {
        ctx.registry.register(txn_id)?;
        let start = LogRecord::Start { txn_id };
        match start.write_to(&ctx.log) {
            Ok(lsn) => log::debug!("Transaction {} started at LSN {}", txn_id, lsn),
            Err(e) => {
                ctx.registry.withdraw(txn_id)?;
                return Err(e);
            }
        }
        Ok(Self {
            txn_id,
            ctx,
            state: TxnState::Active,
        })
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn context(&self) -> &RecoveryContext {
        &self.ctx
    }

    fn check_active(&self) -> Result<()> {
        if self.state == TxnState::Active {
            Ok(())
        } else {
            Err(GraniteError::not_active(self.txn_id))
        }
    }

    fn offset(offset: usize) -> Result<u32> {
        u32::try_from(offset).map_err(|_| GraniteError::Page(format!("offset {} is too large", offset)))
    }

    /// Log an integer change. The page itself is left untouched.
    pub fn set_int(&self, buffer: &Buffer, offset: usize, new_value: i32) -> Result<Lsn> {
        self.check_active()?;
        let old_value = buffer.contents().get_int(offset)?;
        LogRecord::SetInt {
            txn_id: self.txn_id,
            block: buffer.block().clone(),
            offset: Self::offset(offset)?,
            old_value,
            new_value,
        }
        .write_to(&self.ctx.log)
    }

    /// Log a string change. The page itself is left untouched.
    pub fn set_string(&self, buffer: &Buffer, offset: usize, new_value: &str) -> Result<Lsn> {
        self.check_active()?;
        let old_value = buffer.contents().get_string(offset)?;
        // A record redo cannot apply would stop every later recovery
        let page_size = buffer.contents().size();
        if offset + Page::max_length(new_value.len()) > page_size {
            return Err(GraniteError::Page(format!(
                "string of {} bytes at offset {} does not fit a {} byte page",
                new_value.len(),
                offset,
                page_size
            )));
        }
        LogRecord::SetString {
            txn_id: self.txn_id,
            block: buffer.block().clone(),
            offset: Self::offset(offset)?,
            old_value,
            new_value: new_value.to_string(),
        }
        .write_to(&self.ctx.log)
    }

    /// Log COMMIT and wait for it to become durable
    pub fn commit(&mut self) -> Result<Lsn> {
        self.check_active()?;
        let lsn = LogRecord::Commit { txn_id: self.txn_id }.write_to(&self.ctx.log)?;
        self.ctx.log.flush(lsn)?;
        self.state = TxnState::Committed;
        self.ctx.registry.mark_completed(self.txn_id)?;
        log::debug!("Transaction {} committed at LSN {}", self.txn_id, lsn);
        Ok(lsn)
    }

    /// Undo every change of this transaction, make the undo durable, then
    /// log ROLLBACK
    pub fn rollback(&mut self) -> Result<Lsn> {
        self.check_active()?;
        let undone = self.undo_changes()?;
        self.ctx.buffers.flush_all_for(self.txn_id)?;
        let lsn = LogRecord::Rollback { txn_id: self.txn_id }.write_to(&self.ctx.log)?;
        self.ctx.log.flush(lsn)?;
        self.state = TxnState::RolledBack;
        self.ctx.registry.mark_completed(self.txn_id)?;
        log::debug!(
            "Transaction {} rolled back at LSN {} ({} changes undone)",
            self.txn_id,
            lsn,
            undone
        );
        Ok(lsn)
    }

    fn undo_changes(&self) -> Result<usize> {
        let mut undone = 0;
        for entry in self.ctx.log.iter()? {
            let (lsn, bytes) = entry?;
            let record = LogRecord::decode_at(lsn, &bytes)?;
            if record.txn_id() != Some(self.txn_id) {
                continue;
            }
            if let LogRecord::Start { .. } = record {
                break;
            }
            if record.kind().is_modification() {
                record.undo(&self.ctx.buffers)?;
                undone += 1;
            }
        }
        Ok(undone)
    }

    /// Checkpoint on behalf of this transaction. This transaction is not
    /// waited for.
    pub fn checkpoint(&self, cancel: &CancelToken) -> Result<CheckpointOutcome> {
        self.check_active()?;
        run_checkpoint(&self.ctx, Some(self.txn_id), cancel)
    }
}
