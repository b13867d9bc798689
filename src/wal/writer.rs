//! Log writer worker with deferred fsync and durability latches
//!
//! All appends go through one dedicated thread, which serializes physical
//! writes and assigns LSNs in file order. Callers block only until their
//! frame reaches the OS; durability is a separate wait on the
//! [`FsyncState`] latch.
//!
//! ## Deferred fsync
//! - Frames are written to the OS buffer immediately
//! - The worker fsyncs every `fsync_interval_ms`, when `max_unfsynced_bytes`
//!   accumulate, on an explicit force-sync, or at shutdown
//! - Threads waiting for an LSN to become durable park on a condvar and are
//!   all released by the same fsync (group commit)
//!
//! With `fsync_interval_ms == 0` every batch is fsynced before the append
//! returns.

use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{GraniteError, Result};
use crate::types::Lsn;
use super::{FRAME_HEADER_BYTES, MAX_FRAME_BYTES};

/// Configuration for the log writer's batching and deferred fsync.
///
/// # Presets
///
/// - [`LogConfig::default()`] - Balanced (50ms fsync interval)
/// - [`LogConfig::synchronous()`] - fsync before every append returns
/// - [`LogConfig::high_throughput()`] - larger batches, longer interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Maximum number of queued appends written in one batch
    pub max_batch_size: usize,
    /// How often to fsync the log (milliseconds). 0 = fsync per batch.
    pub fsync_interval_ms: u64,
    /// Maximum bytes written but not fsynced before forcing an fsync
    pub max_unfsynced_bytes: usize,
    /// How long a durability wait may block before failing (milliseconds)
    pub durable_wait_timeout_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 128,
            fsync_interval_ms: 50,
            max_unfsynced_bytes: 1 << 20, // 1 MB
            durable_wait_timeout_ms: 30_000,
        }
    }
}

impl LogConfig {
    /// fsync every batch before acknowledging it
    pub fn synchronous() -> Self {
        Self {
            fsync_interval_ms: 0,
            ..Default::default()
        }
    }

    /// Favor throughput over commit latency
    pub fn high_throughput() -> Self {
        Self {
            max_batch_size: 512,
            fsync_interval_ms: 100,
            max_unfsynced_bytes: 4 << 20, // 4 MB
            ..Default::default()
        }
    }
}

/// Shared durability latch between the worker and waiting callers
pub struct FsyncState {
    /// Highest LSN known to be on stable storage
    durable_lsn: AtomicU64,
    /// Highest LSN written to the OS (not necessarily fsynced)
    written_lsn: AtomicU64,
    condvar: Condvar,
    mutex: Mutex<()>,
    shutdown: AtomicBool,
    /// Set once an fsync fails; the log can no longer promise durability
    failed: AtomicBool,
}

impl FsyncState {
    fn new(durable_lsn: Lsn) -> Self {
        Self {
            durable_lsn: AtomicU64::new(durable_lsn),
            written_lsn: AtomicU64::new(durable_lsn),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn written_lsn(&self) -> Lsn {
        self.written_lsn.load(Ordering::Acquire)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Block until `target_lsn` is durable, the log fails, or `timeout` expires.
    pub fn wait_for_durable(&self, target_lsn: Lsn, timeout: Duration) -> Result<()> {
        if self.durable_lsn.load(Ordering::Acquire) >= target_lsn {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self
            .mutex
            .lock()
            .map_err(|_| GraniteError::Internal("FsyncState mutex poisoned".to_string()))?;

        loop {
            if self.durable_lsn.load(Ordering::Acquire) >= target_lsn {
                return Ok(());
            }

            if self.failed.load(Ordering::Acquire) {
                return Err(GraniteError::worker_gone(format!(
                    "log fsync failed before LSN {} became durable",
                    target_lsn
                )));
            }

            if self.shutdown.load(Ordering::Acquire) {
                return Err(GraniteError::worker_gone("log writer shut down during wait"));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GraniteError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "Timeout waiting for LSN {} to become durable (current: {})",
                        target_lsn,
                        self.durable_lsn.load(Ordering::Acquire)
                    ),
                )));
            }

            guard = self
                .condvar
                .wait_timeout(guard, remaining)
                .map_err(|_| GraniteError::Internal("FsyncState condvar wait failed".to_string()))?
                .0;
        }
    }

    fn signal_durable(&self, lsn: Lsn) {
        self.durable_lsn.fetch_max(lsn, Ordering::AcqRel);
        self.condvar.notify_all();
    }

    fn update_written(&self, lsn: Lsn) {
        self.written_lsn.fetch_max(lsn, Ordering::AcqRel);
    }

    fn signal_failure(&self) {
        self.failed.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.condvar.notify_all();
    }
}

/// One frame to append; the worker answers with its LSN
struct AppendRequest {
    payload: Vec<u8>,
    responder: mpsc::SyncSender<Result<Lsn>>,
}

/// Control messages for the worker thread
enum LogMessage {
    Append(AppendRequest),
    /// fsync now and answer with the durable LSN
    ForceSync(mpsc::SyncSender<Result<Lsn>>),
    Shutdown,
}

/// Handle to the log writer thread
pub struct LogWorkerHandle {
    sender: mpsc::SyncSender<LogMessage>,
    fsync_state: Arc<FsyncState>,
    thread: Mutex<Option<JoinHandle<()>>>,
    wait_timeout: Duration,
}

impl LogWorkerHandle {
    /// Spawn the worker over an open log file positioned at its end.
    /// `next_lsn` is the LSN the first new frame receives.
    pub fn spawn(file: File, next_lsn: Lsn, config: LogConfig) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<LogMessage>(10_000);
        let fsync_state = Arc::new(FsyncState::new(next_lsn.saturating_sub(1)));
        let wait_timeout = Duration::from_millis(config.durable_wait_timeout_ms);

        let worker_state = Arc::clone(&fsync_state);
        let thread = std::thread::Builder::new()
            .name("granite-log".to_string())
            .spawn(move || log_worker_thread(file, rx, next_lsn, config, worker_state))?;

        Ok(Self {
            sender: tx,
            fsync_state,
            thread: Mutex::new(Some(thread)),
            wait_timeout,
        })
    }

    /// Append one frame payload; returns once it is written (not necessarily durable)
    pub fn append(&self, payload: Vec<u8>) -> Result<Lsn> {
        if payload.len() > MAX_FRAME_BYTES {
            return Err(GraniteError::Internal(format!(
                "log record of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_FRAME_BYTES
            )));
        }
        let (tx, rx) = mpsc::sync_channel(1);
        let req = AppendRequest {
            payload,
            responder: tx,
        };
        self.sender
            .send(LogMessage::Append(req))
            .map_err(|e| GraniteError::worker_gone(format!("log worker channel closed: {}", e)))?;
        rx.recv()
            .map_err(|e| GraniteError::worker_gone(format!("log worker response lost: {}", e)))?
    }

    /// Wait (on the group-commit latch) for `lsn` to become durable
    pub fn wait_for_durable(&self, lsn: Lsn) -> Result<()> {
        self.fsync_state.wait_for_durable(lsn, self.wait_timeout)
    }

    /// fsync immediately and return the durable LSN
    pub fn force_sync(&self) -> Result<Lsn> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(LogMessage::ForceSync(tx))
            .map_err(|e| GraniteError::worker_gone(format!("log worker channel closed: {}", e)))?;
        rx.recv()
            .map_err(|e| GraniteError::worker_gone(format!("log force sync response lost: {}", e)))?
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.fsync_state.durable_lsn()
    }

    /// Stop the worker after a final fsync and wait for it to exit
    pub fn shutdown(&self) {
        let _ = self.sender.send(LogMessage::Shutdown);
        let handle = match self.thread.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Log worker thread panicked");
            }
        }
    }
}

impl Drop for LogWorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn copy_io_error(e: &io::Error) -> GraniteError {
    GraniteError::Io(io::Error::new(e.kind(), e.to_string()))
}

fn dispatch(
    msg: LogMessage,
    batch: &mut Vec<AppendRequest>,
    force_syncs: &mut Vec<mpsc::SyncSender<Result<Lsn>>>,
    shutdown: &mut bool,
) {
    match msg {
        LogMessage::Append(req) => batch.push(req),
        LogMessage::ForceSync(responder) => force_syncs.push(responder),
        LogMessage::Shutdown => *shutdown = true,
    }
}

/// Worker loop - batches queued appends and performs deferred fsync
fn log_worker_thread(
    mut file: File,
    rx: mpsc::Receiver<LogMessage>,
    mut next_lsn: Lsn,
    config: LogConfig,
    fsync_state: Arc<FsyncState>,
) {
    let fsync_interval = Duration::from_millis(config.fsync_interval_ms);
    let deferred_fsync = config.fsync_interval_ms > 0;

    let mut last_fsync = Instant::now();
    let mut unfsynced_bytes: usize = 0;

    loop {
        let mut batch: Vec<AppendRequest> = Vec::new();
        let mut pending_force_syncs: Vec<mpsc::SyncSender<Result<Lsn>>> = Vec::new();
        let mut should_shutdown = false;

        // Sleep until a message arrives or the deferred fsync falls due
        let first = if deferred_fsync && unfsynced_bytes > 0 {
            rx.recv_timeout(fsync_interval.saturating_sub(last_fsync.elapsed()))
        } else {
            rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected)
        };

        match first {
            Ok(msg) => dispatch(msg, &mut batch, &mut pending_force_syncs, &mut should_shutdown),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                if unfsynced_bytes > 0 && file.sync_data().is_ok() {
                    fsync_state.signal_durable(next_lsn - 1);
                }
                fsync_state.signal_shutdown();
                log::info!("Log worker shutting down (channel closed)");
                break;
            }
        }

        // Pick up whatever else is already queued
        while batch.len() < config.max_batch_size && !should_shutdown {
            match rx.try_recv() {
                Ok(msg) => dispatch(msg, &mut batch, &mut pending_force_syncs, &mut should_shutdown),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let batch_size = batch.len();
            if fsync_state.has_failed() {
                for req in batch {
                    let _ = req
                        .responder
                        .send(Err(GraniteError::worker_gone("log is read-only after an fsync failure")));
                }
            } else {
                let total: usize = batch.iter().map(|r| FRAME_HEADER_BYTES + r.payload.len()).sum();
                let mut frames = BytesMut::with_capacity(total);
                for req in &batch {
                    frames.put_u32_le(req.payload.len() as u32);
                    frames.put_slice(&req.payload);
                }

                let mut result = file.write_all(&frames).and_then(|()| file.flush());
                if result.is_ok() && !deferred_fsync {
                    result = file.sync_data();
                }

                match result {
                    Ok(()) => {
                        let first_lsn = next_lsn;
                        next_lsn += batch_size as u64;
                        fsync_state.update_written(next_lsn - 1);
                        if deferred_fsync {
                            unfsynced_bytes += frames.len();
                        } else {
                            fsync_state.signal_durable(next_lsn - 1);
                            last_fsync = Instant::now();
                        }
                        for (i, req) in batch.into_iter().enumerate() {
                            let _ = req.responder.send(Ok(first_lsn + i as u64));
                        }
                        if batch_size > 1 {
                            log::debug!("Log batch written: {} records, {} bytes", batch_size, total);
                        }
                    }
                    Err(e) => {
                        log::error!("Log write failed: {}", e);
                        fsync_state.signal_failure();
                        for req in batch {
                            let _ = req.responder.send(Err(copy_io_error(&e)));
                        }
                    }
                }
            }
        }

        let force_sync_requested = !pending_force_syncs.is_empty();
        let time_triggered = deferred_fsync && last_fsync.elapsed() >= fsync_interval;
        let size_triggered = unfsynced_bytes >= config.max_unfsynced_bytes;

        if unfsynced_bytes > 0
            && (time_triggered || size_triggered || force_sync_requested || should_shutdown)
        {
            match file.sync_data() {
                Ok(()) => {
                    let synced_lsn = next_lsn - 1;
                    fsync_state.signal_durable(synced_lsn);
                    log::debug!(
                        "Log fsync complete: LSN {}, {} bytes (trigger: {})",
                        synced_lsn,
                        unfsynced_bytes,
                        if force_sync_requested {
                            "force"
                        } else if size_triggered {
                            "size"
                        } else if should_shutdown {
                            "shutdown"
                        } else {
                            "time"
                        }
                    );
                    unfsynced_bytes = 0;
                    last_fsync = Instant::now();
                    for responder in pending_force_syncs {
                        let _ = responder.send(Ok(synced_lsn));
                    }
                }
                Err(e) => {
                    log::error!("Log fsync failed: {}", e);
                    fsync_state.signal_failure();
                    for responder in pending_force_syncs {
                        let _ = responder.send(Err(copy_io_error(&e)));
                    }
                }
            }
        } else {
            for responder in pending_force_syncs {
                let _ = responder.send(Ok(fsync_state.durable_lsn()));
            }
        }

        if should_shutdown {
            fsync_state.signal_shutdown();
            log::debug!("Log worker shutting down (shutdown message)");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    fn spawn_worker(config: LogConfig) -> (tempfile::TempDir, std::path::PathBuf, LogWorkerHandle) {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("wal.log");
        let file = File::create(&path).unwrap();
        let handle = LogWorkerHandle::spawn(file, 1, config).unwrap();
        (temp_dir, path, handle)
    }

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.max_batch_size, 128);
        assert_eq!(config.fsync_interval_ms, 50);
        assert_eq!(config.max_unfsynced_bytes, 1 << 20);
    }

    #[test]
    fn test_log_config_presets() {
        assert_eq!(LogConfig::synchronous().fsync_interval_ms, 0);
        let fast = LogConfig::high_throughput();
        assert_eq!(fast.fsync_interval_ms, 100);
        assert_eq!(fast.max_batch_size, 512);
    }

    #[test]
    fn test_log_config_partial_json() {
        let config: LogConfig = serde_json::from_str(r#"{"fsync_interval_ms": 7}"#).unwrap();
        assert_eq!(config.fsync_interval_ms, 7);
        assert_eq!(config.max_batch_size, 128);
    }

    #[test]
    fn test_fsync_state_only_moves_forward() {
        let state = FsyncState::new(0);
        state.signal_durable(5);
        state.signal_durable(3);
        assert_eq!(state.durable_lsn(), 5);

        state.update_written(10);
        state.update_written(4);
        assert_eq!(state.written_lsn(), 10);
    }

    #[test]
    fn test_fsync_state_wait_already_durable() {
        let state = FsyncState::new(10);
        assert!(state.wait_for_durable(5, Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_fsync_state_wait_timeout() {
        let state = FsyncState::new(0);
        let err = state.wait_for_durable(10, Duration::from_millis(30)).unwrap_err();
        assert!(err.to_string().contains("Timeout"));
    }

    #[test]
    fn test_fsync_state_wait_signaled() {
        let state = Arc::new(FsyncState::new(0));
        let signaller = Arc::clone(&state);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            signaller.signal_durable(10);
        });
        assert!(state.wait_for_durable(10, Duration::from_secs(2)).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_fsync_state_failure_releases_waiters() {
        let state = Arc::new(FsyncState::new(0));
        let signaller = Arc::clone(&state);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            signaller.signal_failure();
        });
        let start = Instant::now();
        let err = state.wait_for_durable(1, Duration::from_secs(5)).unwrap_err();
        handle.join().unwrap();
        assert!(err.to_string().contains("fsync failed"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_worker_assigns_sequential_lsns() {
        let (_dir, path, handle) = spawn_worker(LogConfig::synchronous());
        assert_eq!(handle.append(b"one".to_vec()).unwrap(), 1);
        assert_eq!(handle.append(b"two".to_vec()).unwrap(), 2);
        assert_eq!(handle.append(Vec::new()).unwrap(), 3);

        // 3 headers + 3 + 3 + 0 payload bytes
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, (3 * FRAME_HEADER_BYTES + 6) as u64);
    }

    #[test]
    fn test_worker_synchronous_mode_is_durable_on_return() {
        let (_dir, _path, handle) = spawn_worker(LogConfig::synchronous());
        let lsn = handle.append(b"rec".to_vec()).unwrap();
        assert!(handle.durable_lsn() >= lsn);
    }

    #[test]
    fn test_worker_deferred_mode_becomes_durable() {
        let (_dir, _path, handle) = spawn_worker(LogConfig {
            fsync_interval_ms: 20,
            ..Default::default()
        });
        let lsn = handle.append(b"rec".to_vec()).unwrap();
        handle.wait_for_durable(lsn).unwrap();
        assert!(handle.durable_lsn() >= lsn);
    }

    #[test]
    fn test_worker_force_sync() {
        let (_dir, _path, handle) = spawn_worker(LogConfig {
            fsync_interval_ms: 10_000,
            ..Default::default()
        });
        handle.append(b"a".to_vec()).unwrap();
        handle.append(b"b".to_vec()).unwrap();
        assert_eq!(handle.force_sync().unwrap(), 2);
        assert_eq!(handle.durable_lsn(), 2);
    }

    #[test]
    fn test_worker_size_triggered_fsync() {
        let (_dir, _path, handle) = spawn_worker(LogConfig {
            fsync_interval_ms: 10_000,
            max_unfsynced_bytes: 16,
            ..Default::default()
        });
        for _ in 0..4 {
            handle.append(vec![0u8; 32]).unwrap();
        }
        assert!(handle.durable_lsn() > 0);
    }

    #[test]
    fn test_worker_rejects_oversized_payload() {
        let (_dir, _path, handle) = spawn_worker(LogConfig::synchronous());
        assert!(handle.append(vec![0u8; MAX_FRAME_BYTES + 1]).is_err());
    }

    #[test]
    fn test_worker_append_after_shutdown_fails() {
        let (_dir, _path, handle) = spawn_worker(LogConfig::default());
        handle.append(b"x".to_vec()).unwrap();
        handle.shutdown();
        assert_eq!(handle.durable_lsn(), 1);
        assert!(handle.append(b"y".to_vec()).is_err());
    }

    #[test]
    fn test_worker_concurrent_writers_get_unique_lsns() {
        let (_dir, _path, handle) = spawn_worker(LogConfig {
            fsync_interval_ms: 10,
            ..Default::default()
        });
        let handle = Arc::new(handle);

        let mut threads = Vec::new();
        for t in 0..4u8 {
            let worker = Arc::clone(&handle);
            threads.push(thread::spawn(move || {
                (0..25).map(|_| worker.append(vec![t]).unwrap()).collect::<Vec<_>>()
            }));
        }

        let mut lsns: Vec<Lsn> = threads.into_iter().flat_map(|h| h.join().unwrap()).collect();
        lsns.sort_unstable();
        assert_eq!(lsns, (1..=100).collect::<Vec<_>>());

        handle.wait_for_durable(100).unwrap();
    }
}
