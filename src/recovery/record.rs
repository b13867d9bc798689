//! Log record model: the closed set of record kinds, their binary form and
//! their redo/undo effects.
//!
//! Records are encoded with bincode using fixed-width little-endian
//! integers. The variant index comes first as a `u32`; strings and id lists
//! carry a `u64` length before their contents.

use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{GraniteError, Result};
use crate::storage::BufferManager;
use crate::types::{BlockId, Lsn, TxnId};
use crate::wal::{LogManager, MAX_FRAME_BYTES};

/// Largest encoded record accepted by `decode`
pub const MAX_RECORD_BYTES: usize = MAX_FRAME_BYTES;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_RECORD_BYTES as u64)
        .reject_trailing_bytes()
}

/// A write-ahead log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Transaction started
    Start { txn_id: TxnId },
    /// Transaction committed
    Commit { txn_id: TxnId },
    /// Transaction rolled back (all of its changes have been undone)
    Rollback { txn_id: TxnId },
    /// An integer in a page changed
    SetInt {
        txn_id: TxnId,
        block: BlockId,
        offset: u32,
        old_value: i32,
        new_value: i32,
    },
    /// A string in a page changed
    SetString {
        txn_id: TxnId,
        block: BlockId,
        offset: u32,
        old_value: String,
        new_value: String,
    },
    /// Quiescent checkpoint: no transaction was active and every page was flushed
    Checkpoint,
    /// A non-quiescent checkpoint began
    StartCheckpoint,
    /// The matching non-quiescent checkpoint finished. `coordinator` is the
    /// transaction that drove it, which may still be running.
    EndCheckpoint {
        txn_ids: Vec<TxnId>,
        coordinator: Option<TxnId>,
    },
}

/// The kind of a record, without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Start,
    Commit,
    Rollback,
    SetInt,
    SetString,
    Checkpoint,
    StartCheckpoint,
    EndCheckpoint,
}

impl RecordKind {
    /// True for the two page-changing kinds
    pub fn is_modification(self) -> bool {
        matches!(self, RecordKind::SetInt | RecordKind::SetString)
    }

    /// True for the three checkpoint markers
    pub fn is_checkpoint(self) -> bool {
        matches!(
            self,
            RecordKind::Checkpoint | RecordKind::StartCheckpoint | RecordKind::EndCheckpoint
        )
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Start => "START",
            RecordKind::Commit => "COMMIT",
            RecordKind::Rollback => "ROLLBACK",
            RecordKind::SetInt => "SETINT",
            RecordKind::SetString => "SETSTRING",
            RecordKind::Checkpoint => "CHECKPOINT",
            RecordKind::StartCheckpoint => "START-CHECKPOINT",
            RecordKind::EndCheckpoint => "END-CHECKPOINT",
        };
        f.write_str(name)
    }
}

impl LogRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Start { .. } => RecordKind::Start,
            LogRecord::Commit { .. } => RecordKind::Commit,
            LogRecord::Rollback { .. } => RecordKind::Rollback,
            LogRecord::SetInt { .. } => RecordKind::SetInt,
            LogRecord::SetString { .. } => RecordKind::SetString,
            LogRecord::Checkpoint => RecordKind::Checkpoint,
            LogRecord::StartCheckpoint => RecordKind::StartCheckpoint,
            LogRecord::EndCheckpoint { .. } => RecordKind::EndCheckpoint,
        }
    }

    /// Owning transaction, or `None` for checkpoint markers
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            LogRecord::Start { txn_id }
            | LogRecord::Commit { txn_id }
            | LogRecord::Rollback { txn_id }
            | LogRecord::SetInt { txn_id, .. }
            | LogRecord::SetString { txn_id, .. } => Some(*txn_id),
            LogRecord::Checkpoint | LogRecord::StartCheckpoint | LogRecord::EndCheckpoint { .. } => {
                None
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        codec()
            .serialize(self)
            .map_err(|e| GraniteError::Internal(format!("failed to encode {}: {}", self.kind(), e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        codec()
            .deserialize(bytes)
            .map_err(|e| GraniteError::Corruption(format!("undecodable log record: {}", e)))
    }

    /// Decode the record stored at `lsn`, naming the LSN on failure
    pub fn decode_at(lsn: Lsn, bytes: &[u8]) -> Result<Self> {
        codec()
            .deserialize(bytes)
            .map_err(|e| GraniteError::corrupt_record(lsn, e))
    }

    /// Encode and append to the log, returning the record's LSN
    pub fn write_to(&self, log: &LogManager) -> Result<Lsn> {
        log.append(&self.encode()?)
    }

    /// Re-apply the change. Control and checkpoint records do nothing.
    pub fn redo(&self, buffers: &BufferManager) -> Result<()> {
        match self {
            LogRecord::SetInt {
                txn_id,
                block,
                offset,
                new_value,
                ..
            } => write_int(buffers, *txn_id, block, *offset, *new_value),
            LogRecord::SetString {
                txn_id,
                block,
                offset,
                new_value,
                ..
            } => write_string(buffers, *txn_id, block, *offset, new_value),
            _ => Ok(()),
        }
    }

    /// Restore the value the change overwrote. Control and checkpoint
    /// records do nothing.
    pub fn undo(&self, buffers: &BufferManager) -> Result<()> {
        match self {
            LogRecord::SetInt {
                txn_id,
                block,
                offset,
                old_value,
                ..
            } => write_int(buffers, *txn_id, block, *offset, *old_value),
            LogRecord::SetString {
                txn_id,
                block,
                offset,
                old_value,
                ..
            } => write_string(buffers, *txn_id, block, *offset, old_value),
            _ => Ok(()),
        }
    }
}

// Redo and undo are not logged, so the buffer gets no LSN
fn write_int(buffers: &BufferManager, txn_id: TxnId, block: &BlockId, offset: u32, value: i32) -> Result<()> {
    let handle = buffers.pin(block)?;
    let mut buffer = handle.lock()?;
    buffer.contents_mut().set_int(offset as usize, value)?;
    buffer.set_modified(txn_id, None);
    Ok(())
}

fn write_string(buffers: &BufferManager, txn_id: TxnId, block: &BlockId, offset: u32, value: &str) -> Result<()> {
    let handle = buffers.pin(block)?;
    let mut buffer = handle.lock()?;
    buffer.contents_mut().set_string(offset as usize, value)?;
    buffer.set_modified(txn_id, None);
    Ok(())
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogRecord::Start { txn_id }
            | LogRecord::Commit { txn_id }
            | LogRecord::Rollback { txn_id } => write!(f, "<{} {}>", self.kind(), txn_id),
            LogRecord::SetInt {
                txn_id,
                block,
                offset,
                old_value,
                new_value,
            } => write!(
                f,
                "<SETINT {} {} {} {} -> {}>",
                txn_id, block, offset, old_value, new_value
            ),
            LogRecord::SetString {
                txn_id,
                block,
                offset,
                old_value,
                new_value,
            } => write!(
                f,
                "<SETSTRING {} {} {} {:?} -> {:?}>",
                txn_id, block, offset, old_value, new_value
            ),
            LogRecord::Checkpoint | LogRecord::StartCheckpoint => write!(f, "<{}>", self.kind()),
            LogRecord::EndCheckpoint {
                txn_ids,
                coordinator: None,
            } => write!(f, "<END-CHECKPOINT {:?}>", txn_ids),
            LogRecord::EndCheckpoint {
                txn_ids,
                coordinator: Some(id),
            } => write!(f, "<END-CHECKPOINT {:?} by {}>", txn_ids, id),
        }
    }
}
