//! Error types for granite-recovery
//!
//! A single error enum covers the log, the page store and the recovery
//! protocol. Anything surfaced to the embedding engine goes through it.

use std::fmt;
use std::io;

/// Unified error type for recovery operations
#[derive(Debug)]
pub enum GraniteError {
    /// I/O error (log file, data files, fsync)
    Io(io::Error),
    /// A log record or frame could not be decoded
    Corruption(String),
    /// Offset or length outside a page, or an unreadable string slot
    Page(String),
    /// Operation on a transaction that is no longer active
    Transaction(String),
    /// Another checkpoint is already open
    CheckpointInProgress,
    /// Configuration could not be loaded
    Config(String),
    /// Worker channel closed or similar internal failure
    Internal(String),
}

impl GraniteError {
    /// Create a corruption error for a log record at a known LSN
    pub fn corrupt_record(lsn: u64, detail: impl fmt::Display) -> Self {
        GraniteError::Corruption(format!("log record at LSN {} is corrupt: {}", lsn, detail))
    }

    /// Create a "transaction is not active" error
    pub fn not_active(txn_id: u64) -> Self {
        GraniteError::Transaction(format!("Transaction {} is not active", txn_id))
    }

    /// Build an I/O error for a closed or failed log worker
    pub fn worker_gone(detail: impl fmt::Display) -> Self {
        GraniteError::Io(io::Error::new(io::ErrorKind::Other, detail.to_string()))
    }

    /// True if this error means the log cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(self, GraniteError::Corruption(_))
    }
}

impl fmt::Display for GraniteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraniteError::Io(e) => write!(f, "I/O error: {}", e),
            GraniteError::Corruption(msg) => write!(f, "log corruption: {}", msg),
            GraniteError::Page(msg) => write!(f, "page error: {}", msg),
            GraniteError::Transaction(msg) => write!(f, "{}", msg),
            GraniteError::CheckpointInProgress => write!(f, "a checkpoint is already in progress"),
            GraniteError::Config(msg) => write!(f, "configuration error: {}", msg),
            GraniteError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GraniteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GraniteError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for GraniteError {
    fn from(e: io::Error) -> Self {
        GraniteError::Io(e)
    }
}

impl From<serde_json::Error> for GraniteError {
    fn from(e: serde_json::Error) -> Self {
        GraniteError::Config(e.to_string())
    }
}

/// Result type alias for recovery operations
pub type Result<T> = std::result::Result<T, GraniteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_active_message() {
        let err = GraniteError::not_active(7);
        assert_eq!(err.to_string(), "Transaction 7 is not active");
    }

    #[test]
    fn test_corruption_detection() {
        assert!(GraniteError::corrupt_record(3, "truncated").is_corruption());
        assert!(!GraniteError::CheckpointInProgress.is_corruption());
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let err: GraniteError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("gone"));
    }
}
