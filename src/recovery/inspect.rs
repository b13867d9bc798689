//! Read-only views of the log for tools and tests

use crate::error::Result;
use crate::types::Lsn;
use crate::wal::LogManager;
use super::record::{LogRecord, RecordKind};

/// Summarize the log newest-first, e.g. `COMMIT-MODIFY-START-CHECKPOINT-`.
///
/// Consecutive SETINT/SETSTRING records collapse into one `MODIFY`, including
/// a run at the very end of the log. With `stop_at_checkpoint`, the trail
/// ends at the first checkpoint marker of any kind (included).
pub fn log_trail(log: &LogManager, stop_at_checkpoint: bool) -> Result<String> {
    let mut trail = String::new();
    let mut in_modify_run = false;

    for entry in log.iter()? {
        let (lsn, bytes) = entry?;
        let kind = LogRecord::decode_at(lsn, &bytes)?.kind();

        if kind.is_modification() {
            if !in_modify_run {
                trail.push_str("MODIFY-");
                in_modify_run = true;
            }
            continue;
        }

        in_modify_run = false;
        trail.push_str(&kind.to_string());
        trail.push('-');
        if stop_at_checkpoint && kind.is_checkpoint() {
            break;
        }
    }
    Ok(trail)
}

/// Every record in the log, oldest first
pub fn records_oldest_first(log: &LogManager) -> Result<Vec<(Lsn, LogRecord)>> {
    let mut records = Vec::new();
    for entry in log.iter()? {
        let (lsn, bytes) = entry?;
        records.push((lsn, LogRecord::decode_at(lsn, &bytes)?));
    }
    records.reverse();
    Ok(records)
}

/// Count of each record kind, in first-seen order (oldest first)
pub fn kind_counts(log: &LogManager) -> Result<Vec<(RecordKind, usize)>> {
    let mut counts: Vec<(RecordKind, usize)> = Vec::new();
    for (_, record) in records_oldest_first(log)? {
        let kind = record.kind();
        match counts.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, n)) => *n += 1,
            None => counts.push((kind, 1)),
        }
    }
    Ok(counts)
}
