//! Startup recovery
//!
//! Runs once when a database is opened, before any transaction begins.
//!
//! 1. **Window**: scan the log backward to find where replay can start -
//!    a quiescent CHECKPOINT, the START-CHECKPOINT matching the most recent
//!    END-CHECKPOINT, or the beginning of the log
//! 2. **Redo**: replay the window oldest-first, repeating history. A
//!    ROLLBACK in the window repeats that rollback's undo at the same point.
//!    Transactions with a START but no COMMIT/ROLLBACK are losers, and so
//!    is a checkpoint's coordinator that had not finished by END-CHECKPOINT.
//! 3. **Undo**: scan backward from the end of the log undoing loser changes;
//!    each loser's START closes it out with a durable ROLLBACK
//!
//! Finally every page is flushed and a quiescent CHECKPOINT is logged, so
//! the next recovery stops there.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::Result;
use crate::storage::BufferManager;
use crate::types::{Lsn, TxnId};
use crate::wal::LogManager;
use super::record::LogRecord;

/// Where the redo window began
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStart {
    /// No usable checkpoint; the whole log was replayed
    WholeLog,
    /// Replay began at a quiescent CHECKPOINT
    QuiescentCheckpoint(Lsn),
    /// Replay began at the START-CHECKPOINT paired with the last END-CHECKPOINT
    CheckpointInterval { start_lsn: Lsn, end_lsn: Lsn },
}

/// Summary of one recovery run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub window_start: WindowStart,
    /// Records in the redo window
    pub window_len: usize,
    /// Page changes replayed by redo
    pub redone: usize,
    /// Loser page changes undone
    pub undone: usize,
    /// Transactions rolled back by recovery, in the order they were closed out
    pub losers: Vec<TxnId>,
    /// Highest transaction id anywhere in the log (0 if none)
    pub max_txn_id: TxnId,
    /// LSN of the closing quiescent CHECKPOINT
    pub checkpoint_lsn: Lsn,
}

struct Window {
    start: WindowStart,
    /// Oldest first
    records: Vec<(Lsn, LogRecord)>,
    max_txn_id: TxnId,
}

/// Scan backward for the redo window. The whole log is still read so that
/// the highest transaction id is known.
fn find_window(log: &LogManager) -> Result<Window> {
    let mut records = Vec::new();
    let mut start = WindowStart::WholeLog;
    let mut end_seen: Option<Lsn> = None;
    let mut dangling_start = false;
    let mut closed = false;
    let mut max_txn_id: TxnId = 0;

    for entry in log.iter()? {
        let (lsn, bytes) = entry?;
        let record = LogRecord::decode_at(lsn, &bytes)?;
        if let Some(txn_id) = record.txn_id() {
            max_txn_id = max_txn_id.max(txn_id);
        }
        if closed {
            continue;
        }

        match &record {
            LogRecord::Checkpoint => {
                start = WindowStart::QuiescentCheckpoint(lsn);
                closed = true;
            }
            LogRecord::EndCheckpoint { .. } if end_seen.is_none() && !dangling_start => {
                end_seen = Some(lsn);
            }
            LogRecord::StartCheckpoint => match end_seen {
                Some(end_lsn) => {
                    start = WindowStart::CheckpointInterval {
                        start_lsn: lsn,
                        end_lsn,
                    };
                    closed = true;
                }
                None => {
                    if !dangling_start {
                        log::info!(
                            "Log ends inside the checkpoint started at LSN {}; replaying the whole log",
                            lsn
                        );
                    }
                    dangling_start = true;
                }
            },
            _ => {}
        }
        records.push((lsn, record));
    }

    records.reverse();
    Ok(Window {
        start,
        records,
        max_txn_id,
    })
}

/// Undo `txn_id`'s changes logged before `before_lsn`, newest first,
/// stopping at its START
fn undo_older_changes(
    log: &LogManager,
    buffers: &BufferManager,
    txn_id: TxnId,
    before_lsn: Lsn,
) -> Result<usize> {
    let mut undone = 0;
    for entry in log.iter()? {
        let (lsn, bytes) = entry?;
        if lsn >= before_lsn {
            continue;
        }
        let record = LogRecord::decode_at(lsn, &bytes)?;
        if record.txn_id() != Some(txn_id) {
            continue;
        }
        if let LogRecord::Start { .. } = record {
            break;
        }
        record.undo(buffers)?;
        undone += 1;
    }
    Ok(undone)
}

/// Bring the page store back to a state reflecting exactly the committed
/// transactions in the log.
pub fn recover(log: &LogManager, buffers: &BufferManager) -> Result<RecoveryReport> {
    log::info!("Starting recovery from {}", log.path().display());

    // Phase 1: window
    let window = find_window(log)?;
    log::info!(
        "Recovery window: {:?}, {} records",
        window.start,
        window.records.len()
    );

    // Phase 2: redo
    let mut losers: BTreeSet<TxnId> = BTreeSet::new();
    let mut started_in_window: HashSet<TxnId> = HashSet::new();
    let mut changes: HashMap<TxnId, Vec<usize>> = HashMap::new();
    let mut redone = 0;

    for (idx, (lsn, record)) in window.records.iter().enumerate() {
        match record {
            LogRecord::Start { txn_id } => {
                losers.insert(*txn_id);
                started_in_window.insert(*txn_id);
            }
            LogRecord::Commit { txn_id } => {
                losers.remove(txn_id);
                changes.remove(txn_id);
            }
            LogRecord::Rollback { txn_id } => {
                losers.remove(txn_id);
                // Repeat the rollback: its undo was never logged
                let mut repeated = 0;
                for &change in changes.remove(txn_id).unwrap_or_default().iter().rev() {
                    window.records[change].1.undo(buffers)?;
                    repeated += 1;
                }
                if !started_in_window.contains(txn_id) {
                    repeated += undo_older_changes(log, buffers, *txn_id, window.records[0].0)?;
                }
                log::debug!(
                    "Repeated rollback of transaction {} at LSN {} ({} changes)",
                    txn_id,
                    lsn,
                    repeated
                );
            }
            LogRecord::SetInt { txn_id, .. } | LogRecord::SetString { txn_id, .. } => {
                changes.entry(*txn_id).or_default().push(idx);
                redone += 1;
            }
            LogRecord::EndCheckpoint {
                coordinator: Some(txn_id),
                ..
            } => {
                // Still running at END-CHECKPOINT; its START may be outside
                // the window
                losers.insert(*txn_id);
            }
            _ => {}
        }
        record.redo(buffers)?;
    }
    log::info!("Redo complete: {} changes replayed, {} losers", redone, losers.len());

    // Phase 3: undo
    let mut undone = 0;
    let mut rolled_back = Vec::new();
    if !losers.is_empty() {
        for entry in log.iter()? {
            let (lsn, bytes) = entry?;
            let record = LogRecord::decode_at(lsn, &bytes)?;
            let txn_id = match record.txn_id() {
                Some(id) if losers.contains(&id) => id,
                _ => continue,
            };
            match record {
                LogRecord::Start { .. } => {
                    losers.remove(&txn_id);
                    let rollback_lsn = LogRecord::Rollback { txn_id }.write_to(log)?;
                    log.flush(rollback_lsn)?;
                    rolled_back.push(txn_id);
                    log::info!("Rolled back incomplete transaction {}", txn_id);
                    if losers.is_empty() {
                        break;
                    }
                }
                LogRecord::SetInt { .. } | LogRecord::SetString { .. } => {
                    record.undo(buffers)?;
                    undone += 1;
                }
                _ => {}
            }
        }
    }

    let pages = buffers.flush_all()?;
    let checkpoint_lsn = LogRecord::Checkpoint.write_to(log)?;
    log::info!(
        "Recovery complete: {} redone, {} undone, {} transactions rolled back, {} pages flushed, checkpoint at LSN {}",
        redone,
        undone,
        rolled_back.len(),
        pages,
        checkpoint_lsn
    );
    log.flush(checkpoint_lsn)?;

    Ok(RecoveryReport {
        window_start: window.start,
        window_len: window.records.len(),
        redone,
        undone,
        losers: rolled_back,
        max_txn_id: window.max_txn_id,
        checkpoint_lsn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileManager;
    use crate::types::BlockId;
    use crate::wal::LogConfig;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Fixture {
        files: Arc<FileManager>,
        log: Arc<LogManager>,
        buffers: BufferManager,
    }

    fn open(dir: &Path) -> Fixture {
        let files = Arc::new(FileManager::new(dir.to_path_buf(), 64).unwrap());
        let log = Arc::new(LogManager::open(dir.join("wal.log"), LogConfig::synchronous()).unwrap());
        let buffers = BufferManager::new(Arc::clone(&files), Arc::clone(&log));
        Fixture { files, log, buffers }
    }

    fn append(log: &LogManager, records: &[LogRecord]) {
        for record in records {
            record.write_to(log).unwrap();
        }
    }

    fn set_int(txn_id: TxnId, offset: u32, old_value: i32, new_value: i32) -> LogRecord {
        LogRecord::SetInt {
            txn_id,
            block: BlockId::new("data", 0),
            offset,
            old_value,
            new_value,
        }
    }

    fn end_checkpoint(txn_ids: Vec<TxnId>, coordinator: Option<TxnId>) -> LogRecord {
        LogRecord::EndCheckpoint {
            txn_ids,
            coordinator,
        }
    }

    fn disk_int(files: &FileManager, offset: usize) -> i32 {
        let mut page = crate::storage::Page::new(files.block_size());
        files.read(&BlockId::new("data", 0), &mut page).unwrap();
        page.get_int(offset).unwrap()
    }

    fn records(log: &LogManager) -> Vec<LogRecord> {
        let mut all: Vec<LogRecord> = log
            .iter()
            .unwrap()
            .map(|e| {
                let (lsn, bytes) = e.unwrap();
                LogRecord::decode_at(lsn, &bytes).unwrap()
            })
            .collect();
        all.reverse();
        all
    }

    #[test]
    fn test_empty_log() {
        let dir = tempdir().unwrap();
        let fx = open(dir.path());
        let report = recover(&fx.log, &fx.buffers).unwrap();
        assert_eq!(report.window_start, WindowStart::WholeLog);
        assert_eq!(report.window_len, 0);
        assert_eq!(report.max_txn_id, 0);
        assert_eq!(report.checkpoint_lsn, 1);
        assert_eq!(records(&fx.log), vec![LogRecord::Checkpoint]);
    }

    #[test]
    fn test_committed_redone_uncommitted_undone() {
        let dir = tempdir().unwrap();
        let fx = open(dir.path());
        append(
            &fx.log,
            &[
                LogRecord::Start { txn_id: 1 },
                set_int(1, 0, 0, 5),
                LogRecord::Commit { txn_id: 1 },
                LogRecord::Start { txn_id: 2 },
                set_int(2, 4, 0, 9),
            ],
        );

        let report = recover(&fx.log, &fx.buffers).unwrap();
        assert_eq!(report.losers, vec![2]);
        assert_eq!(report.redone, 2);
        assert_eq!(report.undone, 1);
        assert_eq!(report.max_txn_id, 2);
        assert_eq!(disk_int(&fx.files, 0), 5);
        assert_eq!(disk_int(&fx.files, 4), 0);

        let all = records(&fx.log);
        assert_eq!(all[5], LogRecord::Rollback { txn_id: 2 });
        assert_eq!(all[6], LogRecord::Checkpoint);
    }

    #[test]
    fn test_quiescent_checkpoint_bounds_window() {
        let dir = tempdir().unwrap();
        let fx = open(dir.path());
        append(
            &fx.log,
            &[
                LogRecord::Start { txn_id: 1 },
                set_int(1, 0, 0, 5),
                LogRecord::Commit { txn_id: 1 },
                LogRecord::Checkpoint,
                LogRecord::Start { txn_id: 2 },
                set_int(2, 8, 0, 3),
                LogRecord::Commit { txn_id: 2 },
            ],
        );

        let report = recover(&fx.log, &fx.buffers).unwrap();
        assert_eq!(report.window_start, WindowStart::QuiescentCheckpoint(4));
        assert_eq!(report.window_len, 4);
        assert_eq!(report.redone, 1);
        // Txn 1 precedes the window and is not replayed
        assert_eq!(disk_int(&fx.files, 0), 0);
        assert_eq!(disk_int(&fx.files, 8), 3);
        assert_eq!(report.max_txn_id, 2);
    }

    #[test]
    fn test_checkpoint_interval_bounds_window() {
        let dir = tempdir().unwrap();
        let fx = open(dir.path());
        append(
            &fx.log,
            &[
                LogRecord::Start { txn_id: 1 },
                set_int(1, 0, 0, 7),
                LogRecord::Start { txn_id: 2 },
                LogRecord::StartCheckpoint,
                set_int(2, 4, 0, 1),
                LogRecord::Commit { txn_id: 1 },
                LogRecord::Commit { txn_id: 2 },
                end_checkpoint(vec![1, 2], None),
                LogRecord::Start { txn_id: 3 },
                set_int(3, 8, 0, 2),
            ],
        );

        let report = recover(&fx.log, &fx.buffers).unwrap();
        assert_eq!(
            report.window_start,
            WindowStart::CheckpointInterval {
                start_lsn: 4,
                end_lsn: 8
            }
        );
        assert_eq!(report.window_len, 7);
        assert_eq!(report.redone, 2);
        assert_eq!(report.losers, vec![3]);
        // The pre-window change of txn 1 was not replayed
        assert_eq!(disk_int(&fx.files, 0), 0);
        assert_eq!(disk_int(&fx.files, 4), 1);
        assert_eq!(disk_int(&fx.files, 8), 0);
    }

    #[test]
    fn test_dangling_start_checkpoint_uses_whole_log() {
        let dir = tempdir().unwrap();
        let fx = open(dir.path());
        append(
            &fx.log,
            &[
                LogRecord::Start { txn_id: 1 },
                set_int(1, 0, 0, 4),
                LogRecord::StartCheckpoint,
                LogRecord::Commit { txn_id: 1 },
                end_checkpoint(vec![1], None),
                LogRecord::Start { txn_id: 2 },
                LogRecord::StartCheckpoint,
                set_int(2, 4, 0, 6),
            ],
        );

        let report = recover(&fx.log, &fx.buffers).unwrap();
        assert_eq!(report.window_start, WindowStart::WholeLog);
        assert_eq!(report.window_len, 8);
        assert_eq!(disk_int(&fx.files, 0), 4);
        assert_eq!(disk_int(&fx.files, 4), 0);
        assert_eq!(report.losers, vec![2]);
    }

    #[test]
    fn test_dangling_start_stops_at_quiescent_checkpoint() {
        let dir = tempdir().unwrap();
        let fx = open(dir.path());
        append(
            &fx.log,
            &[
                LogRecord::Start { txn_id: 1 },
                LogRecord::Commit { txn_id: 1 },
                LogRecord::Checkpoint,
                LogRecord::Start { txn_id: 2 },
                LogRecord::StartCheckpoint,
            ],
        );
        let report = recover(&fx.log, &fx.buffers).unwrap();
        assert_eq!(report.window_start, WindowStart::QuiescentCheckpoint(3));
        assert_eq!(report.window_len, 3);
        assert_eq!(report.losers, vec![2]);
    }

    #[test]
    fn test_rolled_back_transaction_stays_rolled_back() {
        let dir = tempdir().unwrap();
        let fx = open(dir.path());
        append(
            &fx.log,
            &[
                LogRecord::Start { txn_id: 1 },
                set_int(1, 0, 0, 5),
                set_int(1, 0, 5, 6),
                LogRecord::Rollback { txn_id: 1 },
                LogRecord::Start { txn_id: 2 },
                set_int(2, 0, 0, 8),
                LogRecord::Commit { txn_id: 2 },
            ],
        );

        let report = recover(&fx.log, &fx.buffers).unwrap();
        assert!(report.losers.is_empty());
        assert_eq!(disk_int(&fx.files, 0), 8);
    }

    #[test]
    fn test_rollback_spanning_window_start() {
        let dir = tempdir().unwrap();
        let fx = open(dir.path());
        append(
            &fx.log,
            &[
                LogRecord::Start { txn_id: 1 },
                set_int(1, 0, 0, 5),
                LogRecord::StartCheckpoint,
                set_int(1, 0, 5, 7),
                LogRecord::Rollback { txn_id: 1 },
                end_checkpoint(vec![1], None),
            ],
        );

        recover(&fx.log, &fx.buffers).unwrap();
        assert_eq!(disk_int(&fx.files, 0), 0);
    }

    #[test]
    fn test_recovery_twice_is_stable() {
        let dir = tempdir().unwrap();
        let fx = open(dir.path());
        append(
            &fx.log,
            &[
                LogRecord::Start { txn_id: 1 },
                set_int(1, 0, 0, 5),
                LogRecord::Commit { txn_id: 1 },
                LogRecord::Start { txn_id: 2 },
                set_int(2, 0, 5, 9),
            ],
        );

        recover(&fx.log, &fx.buffers).unwrap();
        let second = recover(&fx.log, &fx.buffers).unwrap();
        assert_eq!(second.window_start, WindowStart::QuiescentCheckpoint(7));
        assert!(second.losers.is_empty());
        assert_eq!(disk_int(&fx.files, 0), 5);
    }

    #[test]
    fn test_corrupt_record_aborts_recovery() {
        let dir = tempdir().unwrap();
        let fx = open(dir.path());
        append(&fx.log, &[LogRecord::Start { txn_id: 1 }]);
        fx.log.append(&[0xff, 0xff]).unwrap();
        append(&fx.log, &[LogRecord::Commit { txn_id: 1 }]);

        let err = recover(&fx.log, &fx.buffers).unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("LSN 2"));
    }

    #[test]
    fn test_unfinished_coordinator_is_undone() {
        let dir = tempdir().unwrap();
        let fx = open(dir.path());
        append(
            &fx.log,
            &[
                LogRecord::Start { txn_id: 1 },
                set_int(1, 0, 0, 3),
                LogRecord::StartCheckpoint,
                end_checkpoint(vec![], Some(1)),
                set_int(1, 8, 0, 7),
            ],
        );
        // The checkpoint flushed the pre-checkpoint change
        let mut page = crate::storage::Page::new(fx.files.block_size());
        page.set_int(0, 3).unwrap();
        fx.files.write(&BlockId::new("data", 0), &page).unwrap();

        let report = recover(&fx.log, &fx.buffers).unwrap();
        assert_eq!(
            report.window_start,
            WindowStart::CheckpointInterval {
                start_lsn: 3,
                end_lsn: 4
            }
        );
        assert_eq!(report.losers, vec![1]);
        assert_eq!(report.undone, 2);
        assert_eq!(disk_int(&fx.files, 0), 0);
        assert_eq!(disk_int(&fx.files, 8), 0);
    }

    #[test]
    fn test_coordinator_committed_after_checkpoint_is_kept() {
        let dir = tempdir().unwrap();
        let fx = open(dir.path());
        append(
            &fx.log,
            &[
                LogRecord::Start { txn_id: 1 },
                LogRecord::StartCheckpoint,
                end_checkpoint(vec![], Some(1)),
                set_int(1, 4, 0, 9),
                LogRecord::Commit { txn_id: 1 },
            ],
        );

        let report = recover(&fx.log, &fx.buffers).unwrap();
        assert!(report.losers.is_empty());
        assert_eq!(disk_int(&fx.files, 4), 9);
    }
}
