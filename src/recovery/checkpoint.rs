//! Non-quiescent checkpoints
//!
//! A checkpoint runs alongside live transactions:
//!
//! 1. **Start** - claim the registry's checkpoint slot, log START-CHECKPOINT
//!    and remember which transactions are running (the drain set)
//! 2. **Wait** - poll until every transaction in the drain set has finished
//! 3. **Finish** - flush every dirty page, then log END-CHECKPOINT naming the
//!    coordinating transaction, if any
//!
//! Once END-CHECKPOINT is durable, nothing logged before the matching
//! START-CHECKPOINT is needed to rebuild the database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Lsn, TxnId};
use super::manager::RecoveryContext;
use super::record::LogRecord;
use super::registry::TransactionRegistry;

/// Which transaction ids END-CHECKPOINT carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndCheckpointPayload {
    /// The transactions that were active at START-CHECKPOINT
    #[default]
    DrainedSet,
    /// Every transaction that finished while the checkpoint was open
    CompletedSinceStart,
}

/// Checkpoint tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Delay between registry polls while waiting for the drain set
    pub poll_interval_ms: u64,
    /// Give up waiting after this long. `None` waits indefinitely.
    pub max_wait_ms: Option<u64>,
    pub payload: EndCheckpointPayload,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_wait_ms: None,
            payload: EndCheckpointPayload::default(),
        }
    }
}

impl CheckpointConfig {
    /// Short poll interval, for tests and interactive tools
    pub fn responsive() -> Self {
        Self {
            poll_interval_ms: 10,
            ..Default::default()
        }
    }
}

/// Lets another thread abandon a checkpoint that is waiting
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How a checkpoint attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// END-CHECKPOINT is durable
    Completed {
        start_lsn: Lsn,
        end_lsn: Lsn,
        /// Transactions that were waited for
        drained: Vec<TxnId>,
        /// Ids written into END-CHECKPOINT
        recorded: Vec<TxnId>,
        pages_flushed: usize,
    },
    /// Cancelled during the wait; no END-CHECKPOINT was written
    Cancelled { start_lsn: Lsn },
    /// `max_wait_ms` elapsed during the wait; no END-CHECKPOINT was written
    TimedOut { start_lsn: Lsn },
}

impl CheckpointOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CheckpointOutcome::Completed { .. })
    }

    pub fn start_lsn(&self) -> Lsn {
        match self {
            CheckpointOutcome::Completed { start_lsn, .. }
            | CheckpointOutcome::Cancelled { start_lsn }
            | CheckpointOutcome::TimedOut { start_lsn } => *start_lsn,
        }
    }
}

enum WaitResult {
    Drained,
    Cancelled,
    TimedOut,
}

/// Releases the registry's checkpoint slot however the attempt ends
struct OpenCheckpoint<'a> {
    registry: &'a TransactionRegistry,
}

impl Drop for OpenCheckpoint<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.registry.close_checkpoint() {
            log::error!("Failed to release checkpoint slot: {}", e);
        }
    }
}

fn wait_for_drain(
    registry: &TransactionRegistry,
    drain_set: &[TxnId],
    config: &CheckpointConfig,
    cancel: &CancelToken,
) -> Result<WaitResult> {
    let poll = Duration::from_millis(config.poll_interval_ms);
    let deadline = config
        .max_wait_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    loop {
        if cancel.is_cancelled() {
            return Ok(WaitResult::Cancelled);
        }

        let mut pending = 0;
        for &txn_id in drain_set {
            if !registry.is_idle(txn_id)? {
                pending += 1;
            }
        }
        if pending == 0 {
            return Ok(WaitResult::Drained);
        }

        let sleep_for = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(WaitResult::TimedOut);
                }
                remaining.min(poll)
            }
            None => poll,
        };
        log::debug!("Checkpoint waiting on {} transactions", pending);
        thread::sleep(sleep_for);
    }
}

/// Run one checkpoint. `coordinator` is the transaction driving it, which
/// is never waited for. Its id goes into END-CHECKPOINT so recovery still
/// treats it as incomplete if it never finishes.
pub(crate) fn run_checkpoint(
    ctx: &RecoveryContext,
    coordinator: Option<TxnId>,
    cancel: &CancelToken,
) -> Result<CheckpointOutcome> {
    ctx.registry.open_checkpoint()?;
    let _slot = OpenCheckpoint {
        registry: &ctx.registry,
    };

    // The drain set is the active set as of the append, not the flush
    let start_lsn = LogRecord::StartCheckpoint.write_to(&ctx.log)?;
    let drained: Vec<TxnId> = ctx
        .registry
        .active_transaction_ids()?
        .into_iter()
        .filter(|&id| Some(id) != coordinator)
        .collect();
    ctx.log.flush(start_lsn)?;
    log::info!(
        "Checkpoint started at LSN {}, waiting on {:?}",
        start_lsn,
        drained
    );

    match wait_for_drain(&ctx.registry, &drained, &ctx.checkpoint, cancel)? {
        WaitResult::Drained => {}
        WaitResult::Cancelled => {
            log::info!("Checkpoint at LSN {} cancelled", start_lsn);
            return Ok(CheckpointOutcome::Cancelled { start_lsn });
        }
        WaitResult::TimedOut => {
            log::warn!(
                "Checkpoint at LSN {} timed out after {:?} ms",
                start_lsn,
                ctx.checkpoint.max_wait_ms
            );
            return Ok(CheckpointOutcome::TimedOut { start_lsn });
        }
    }

    if log::log_enabled!(log::Level::Debug) {
        log::debug!("Checkpoint flushing {:?}", ctx.buffers.dirty_blocks()?);
    }
    let pages_flushed = ctx.buffers.flush_all()?;

    let recorded = match ctx.checkpoint.payload {
        EndCheckpointPayload::DrainedSet => drained.clone(),
        EndCheckpointPayload::CompletedSinceStart => ctx.registry.completed_since_last_checkpoint()?,
    };
    let end_lsn = LogRecord::EndCheckpoint {
        txn_ids: recorded.clone(),
        coordinator,
    }
    .write_to(&ctx.log)?;
    ctx.log.flush(end_lsn)?;

    log::info!(
        "Checkpoint complete: LSN {}..{}, {} pages flushed",
        start_lsn,
        end_lsn,
        pages_flushed
    );

    Ok(CheckpointOutcome::Completed {
        start_lsn,
        end_lsn,
        drained,
        recorded,
        pages_flushed,
    })
}
