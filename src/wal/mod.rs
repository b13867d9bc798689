//! Append-only write-ahead log
//!
//! The log is a single file of length-prefixed frames:
//!
//! ```text
//! [u32 LE payload length][payload] [u32 LE payload length][payload] ...
//! ```
//!
//! Frame payloads are opaque here; `recovery::record` gives them meaning.
//! A record's LSN is its 1-based position in the file.

pub mod manager;
pub mod writer;

pub use manager::{LogIterator, LogManager};
pub use writer::LogConfig;

/// Size of the length prefix in front of every frame
pub const FRAME_HEADER_BYTES: usize = 4;

/// Largest payload a single frame may carry
pub const MAX_FRAME_BYTES: usize = 1 << 20;
