//! Core identifiers shared by the log, the page store and recovery

use serde::{Deserialize, Serialize};
use std::fmt;

/// Log Sequence Number - 1-based position of a record in the log
pub type Lsn = u64;

/// Transaction ID
pub type TxnId = u64;

/// Identifies a block on disk: a file name and a block number within it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub file: String,
    pub number: u64,
}

impl BlockId {
    pub fn new(file: impl Into<String>, number: u64) -> Self {
        Self {
            file: file.into(),
            number,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[file {}, block {}]", self.file, self.number)
    }
}

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    RolledBack,
}
