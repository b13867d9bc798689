//! granite-recovery - write-ahead logging and crash recovery for a page store
//!
//! ## Guarantees
//! After an uncontrolled restart the data files reflect exactly the
//! transactions whose COMMIT reached the log durably, and nothing of the
//! ones that did not.
//!
//! ## Pieces
//! - [`wal`] - append-only log file, background writer with group commit
//! - [`storage`] - pages, block files and the buffer pool
//! - [`recovery`] - log records, per-transaction logging, non-quiescent
//!   checkpoints and startup recovery
//! - [`tx`] - the transaction handle clients use
//!
//! [`Database::open`] wires these together and runs startup recovery before
//! any transaction can begin.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod recovery;
pub mod storage;
pub mod tx;
pub mod types;
pub mod wal;

use crate::error::Result;
use crate::recovery::{
    CancelToken, CheckpointConfig, CheckpointOutcome, RecoveryContext, RecoveryManager, RecoveryReport,
    TransactionRegistry,
};
use crate::storage::{BufferManager, FileManager};
use crate::tx::Transaction;
use crate::wal::{LogConfig, LogManager};

/// Database configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for the log and data files
    pub data_dir: PathBuf,
    /// Page size in bytes
    pub block_size: usize,
    /// Log file name inside `data_dir`
    pub log_file: String,
    pub log: LogConfig,
    pub checkpoint: CheckpointConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            block_size: 400,
            log_file: "wal.log".to_string(),
            log: LogConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl Config {
    /// Load a JSON configuration file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(&self.log_file)
    }
}

/// An open database: recovered page store plus its log
pub struct Database {
    config: Config,
    files: Arc<FileManager>,
    ctx: RecoveryContext,
    report: RecoveryReport,
}

impl Database {
    /// Open the database in `config.data_dir`, running startup recovery
    pub fn open(config: Config) -> Result<Self> {
        let files = Arc::new(FileManager::new(config.data_dir.clone(), config.block_size)?);
        let log = Arc::new(LogManager::open(config.log_path(), config.log.clone())?);
        let buffers = Arc::new(BufferManager::new(Arc::clone(&files), Arc::clone(&log)));

        let report = recovery::recover(&log, &buffers)?;

        let registry = Arc::new(TransactionRegistry::new());
        registry.reserve_through(report.max_txn_id)?;

        log::info!(
            "Database open in {:?}: next transaction id {}",
            config.data_dir,
            report.max_txn_id + 1
        );

        let ctx = RecoveryContext {
            log,
            buffers,
            registry,
            checkpoint: config.checkpoint.clone(),
        };
        Ok(Self {
            config,
            files,
            ctx,
            report,
        })
    }

    /// Start a new transaction
    pub fn begin(&self) -> Result<Transaction> {
        let txn_id = self.ctx.registry.allocate_txn_id()?;
        let recovery = RecoveryManager::begin(txn_id, self.ctx.clone())?;
        Ok(Transaction::new(recovery))
    }

    /// Run a checkpoint not tied to any transaction
    pub fn checkpoint(&self, cancel: &CancelToken) -> Result<CheckpointOutcome> {
        self.ctx.checkpoint(cancel)
    }

    /// Flush every dirty page and sync the log. Active transactions are
    /// left as they are.
    pub fn close(self) -> Result<()> {
        let pages = self.ctx.buffers.flush_all()?;
        let lsn = self.ctx.log.force_sync()?;
        log::info!("Database closed: {} pages flushed, log durable to LSN {}", pages, lsn);
        Ok(())
    }

    /// What startup recovery did when this database was opened
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.ctx.log
    }

    pub fn buffers(&self) -> &Arc<BufferManager> {
        &self.ctx.buffers
    }

    pub fn files(&self) -> &Arc<FileManager> {
        &self.files
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.ctx.registry
    }

    pub fn context(&self) -> &RecoveryContext {
        &self.ctx
    }
}
