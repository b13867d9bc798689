//! Page store: page images, block files and the buffer pool

pub mod buffer;
pub mod file;
pub mod page;

pub use buffer::{Buffer, BufferHandle, BufferManager};
pub use file::FileManager;
pub use page::Page;
