//! Transaction registry
//!
//! Tracks which transactions are running, which finished while a checkpoint
//! was open, and whether a checkpoint is currently open. One registry is
//! shared by every transaction of a database through an `Arc`.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use crate::error::{GraniteError, Result};
use crate::types::TxnId;

#[derive(Debug)]
struct RegistryState {
    next_txn_id: TxnId,
    active: BTreeSet<TxnId>,
    /// Completion order since the open checkpoint began
    completed: Vec<TxnId>,
    checkpoint_open: bool,
}

/// Active-transaction bookkeeping shared by transactions and checkpoints
#[derive(Debug)]
pub struct TransactionRegistry {
    state: Mutex<RegistryState>,
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_txn_id: 1,
                active: BTreeSet::new(),
                completed: Vec::new(),
                checkpoint_open: false,
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| GraniteError::Internal("transaction registry lock poisoned".to_string()))
    }

    /// Hand out the next unused transaction id
    pub fn allocate_txn_id(&self) -> Result<TxnId> {
        let mut state = self.state()?;
        let id = state.next_txn_id;
        state.next_txn_id += 1;
        Ok(id)
    }

    /// Make sure ids up to and including `txn_id` are never handed out
    pub fn reserve_through(&self, txn_id: TxnId) -> Result<()> {
        let mut state = self.state()?;
        state.next_txn_id = state.next_txn_id.max(txn_id + 1);
        Ok(())
    }

    /// Mark a transaction active. Must happen before its START is logged.
    pub fn register(&self, txn_id: TxnId) -> Result<()> {
        let mut state = self.state()?;
        if !state.active.insert(txn_id) {
            return Err(GraniteError::Transaction(format!(
                "Transaction {} is already active",
                txn_id
            )));
        }
        state.next_txn_id = state.next_txn_id.max(txn_id + 1);
        Ok(())
    }

    /// Forget a transaction whose START never made it into the log
    pub fn withdraw(&self, txn_id: TxnId) -> Result<()> {
        self.state()?.active.remove(&txn_id);
        Ok(())
    }

    /// Record that a transaction's COMMIT or ROLLBACK is durable
    pub fn mark_completed(&self, txn_id: TxnId) -> Result<()> {
        let mut state = self.state()?;
        if state.active.remove(&txn_id) && state.checkpoint_open {
            state.completed.push(txn_id);
        }
        Ok(())
    }

    pub fn is_active(&self, txn_id: TxnId) -> Result<bool> {
        Ok(self.state()?.active.contains(&txn_id))
    }

    /// A transaction is idle once it has committed or rolled back
    pub fn is_idle(&self, txn_id: TxnId) -> Result<bool> {
        Ok(!self.is_active(txn_id)?)
    }

    /// Active transaction ids in ascending order
    pub fn active_transaction_ids(&self) -> Result<Vec<TxnId>> {
        Ok(self.state()?.active.iter().copied().collect())
    }

    /// Ids that completed since the open checkpoint began, in completion order
    pub fn completed_since_last_checkpoint(&self) -> Result<Vec<TxnId>> {
        Ok(self.state()?.completed.clone())
    }

    /// Claim the checkpoint slot and reset the completed list
    pub fn open_checkpoint(&self) -> Result<()> {
        let mut state = self.state()?;
        if state.checkpoint_open {
            return Err(GraniteError::CheckpointInProgress);
        }
        state.checkpoint_open = true;
        state.completed.clear();
        Ok(())
    }

    /// Release the checkpoint slot
    pub fn close_checkpoint(&self) -> Result<()> {
        let mut state = self.state()?;
        state.checkpoint_open = false;
        state.completed.clear();
        Ok(())
    }

    pub fn checkpoint_in_progress(&self) -> Result<bool> {
        Ok(self.state()?.checkpoint_open)
    }
}
