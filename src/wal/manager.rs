//! Log manager: opening the log, appending, flushing and reverse iteration

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Buf;

use crate::error::{GraniteError, Result};
use crate::types::Lsn;
use super::writer::{LogConfig, LogWorkerHandle};
use super::{FRAME_HEADER_BYTES, MAX_FRAME_BYTES};

/// Location of one complete frame's payload
#[derive(Debug, Clone, Copy)]
struct FrameLocation {
    offset: u64,
    len: u32,
}

/// Frames found in a log file, plus the byte length they cover
struct FrameIndex {
    frames: Vec<FrameLocation>,
    valid_len: u64,
}

/// Walk the frame headers of `file` up to `file_len`.
/// A trailing partial frame is left out of the index.
fn index_frames(file: &mut File, file_len: u64) -> Result<FrameIndex> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(file);
    let mut frames = Vec::new();
    let mut pos = 0u64;

    while pos + FRAME_HEADER_BYTES as u64 <= file_len {
        let mut header = [0u8; FRAME_HEADER_BYTES];
        reader.read_exact(&mut header)?;
        let len = (&header[..]).get_u32_le();
        if len as usize > MAX_FRAME_BYTES {
            return Err(GraniteError::Corruption(format!(
                "frame {} at byte {} claims {} bytes",
                frames.len() + 1,
                pos,
                len
            )));
        }
        let end = pos + FRAME_HEADER_BYTES as u64 + len as u64;
        if end > file_len {
            break;
        }
        frames.push(FrameLocation {
            offset: pos + FRAME_HEADER_BYTES as u64,
            len,
        });
        reader.seek_relative(len as i64)?;
        pos = end;
    }

    Ok(FrameIndex {
        frames,
        valid_len: pos,
    })
}

/// The write-ahead log for one database directory.
///
/// Appends go through a background writer (see [`super::writer`]);
/// [`LogManager::flush`] is the durability barrier every WAL rule check
/// goes through.
pub struct LogManager {
    path: PathBuf,
    worker: LogWorkerHandle,
}

impl LogManager {
    /// Open (or create) the log at `path`.
    ///
    /// An incomplete frame at the end of the file, left by a crash in the
    /// middle of a write, is cut off. LSNs continue after the last complete
    /// frame.
    pub fn open(path: impl Into<PathBuf>, config: LogConfig) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();
        let index = index_frames(&mut file, file_len)?;

        if index.valid_len < file_len {
            log::warn!(
                "Truncating torn log tail: {} bytes after record {} in {}",
                file_len - index.valid_len,
                index.frames.len(),
                path.display()
            );
            file.set_len(index.valid_len)?;
        }
        // Records that survived the crash may still sit only in the OS cache
        file.sync_all()?;
        file.seek(SeekFrom::Start(index.valid_len))?;

        let record_count = index.frames.len() as u64;
        let worker = LogWorkerHandle::spawn(file, record_count + 1, config)?;
        log::info!("Opened log {} ({} records)", path.display(), record_count);

        Ok(Self { path, worker })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record payload and return its LSN
    pub fn append(&self, payload: &[u8]) -> Result<Lsn> {
        self.worker.append(payload.to_vec())
    }

    /// Block until every record up to and including `lsn` is durable
    pub fn flush(&self, lsn: Lsn) -> Result<()> {
        self.worker.wait_for_durable(lsn)
    }

    /// fsync whatever has been written and return the durable LSN
    pub fn force_sync(&self) -> Result<Lsn> {
        self.worker.force_sync()
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.worker.durable_lsn()
    }

    /// Iterate the records currently in the log, newest first
    pub fn iter(&self) -> Result<LogIterator> {
        LogIterator::open(&self.path)
    }
}

/// Reverse iterator over log payloads, newest record first.
///
/// The iterator sees the log as it was when it was created; records
/// appended afterwards are not visited.
pub struct LogIterator {
    file: File,
    frames: Vec<FrameLocation>,
    remaining: usize,
}

impl LogIterator {
    /// Open a reverse iterator over the log file at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let index = index_frames(&mut file, file_len)?;
        let remaining = index.frames.len();
        Ok(Self {
            file,
            frames: index.frames,
            remaining,
        })
    }

    fn read_frame(&mut self, idx: usize) -> Result<Vec<u8>> {
        let loc = self.frames[idx];
        let mut payload = vec![0u8; loc.len as usize];
        self.file.seek(SeekFrom::Start(loc.offset))?;
        self.file.read_exact(&mut payload)?;
        Ok(payload)
    }
}

impl Iterator for LogIterator {
    type Item = Result<(Lsn, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let idx = self.remaining;
        Some(self.read_frame(idx).map(|payload| (idx as Lsn + 1, payload)))
    }
}
