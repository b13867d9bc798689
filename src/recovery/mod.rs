//! Crash recovery: log records, per-transaction logging, checkpoints and
//! startup recovery

pub mod checkpoint;
pub mod inspect;
pub mod manager;
pub mod record;
pub mod registry;
pub mod restart;

pub use checkpoint::{CancelToken, CheckpointConfig, CheckpointOutcome, EndCheckpointPayload};
pub use manager::{RecoveryContext, RecoveryManager};
pub use record::{LogRecord, RecordKind};
pub use registry::TransactionRegistry;
pub use restart::{recover, RecoveryReport, WindowStart};
