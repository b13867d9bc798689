//! Fixed-size page images
//!
//! A page holds the bytes of one block. Values are encoded at caller-chosen
//! offsets:
//! - integers: 4-byte big-endian `i32`
//! - strings: 4-byte big-endian length, then UTF-8 bytes
//!
//! Every accessor is bounds-checked and reports `GraniteError::Page`
//! instead of panicking, since offsets come straight out of the log during
//! recovery.

use bytes::{Buf, BufMut};

use crate::error::{GraniteError, Result};

/// Width of an encoded integer
pub const INT_BYTES: usize = 4;

/// The in-memory image of one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    data: Vec<u8>,
}

impl Page {
    /// Create a zero-filled page
    pub fn new(block_size: usize) -> Self {
        Self {
            data: vec![0; block_size],
        }
    }

    /// Wrap existing bytes (e.g. read from disk)
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    pub fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Bytes needed to store a string of `strlen` bytes
    pub fn max_length(strlen: usize) -> usize {
        INT_BYTES + strlen
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(GraniteError::Page(format!(
                "range {}..+{} outside page of {} bytes",
                offset,
                len,
                self.data.len()
            ))),
        }
    }

    pub fn get_int(&self, offset: usize) -> Result<i32> {
        self.check(offset, INT_BYTES)?;
        let mut buf = &self.data[offset..offset + INT_BYTES];
        Ok(buf.get_i32())
    }

    pub fn set_int(&mut self, offset: usize, value: i32) -> Result<()> {
        self.check(offset, INT_BYTES)?;
        let mut buf = &mut self.data[offset..offset + INT_BYTES];
        buf.put_i32(value);
        Ok(())
    }

    pub fn get_string(&self, offset: usize) -> Result<String> {
        self.check(offset, INT_BYTES)?;
        let mut header = &self.data[offset..offset + INT_BYTES];
        let len = header.get_i32();
        if len < 0 {
            return Err(GraniteError::Page(format!(
                "negative string length {} at offset {}",
                len, offset
            )));
        }
        let start = offset + INT_BYTES;
        let len = len as usize;
        self.check(start, len)?;
        String::from_utf8(self.data[start..start + len].to_vec()).map_err(|e| {
            GraniteError::Page(format!("invalid UTF-8 string at offset {}: {}", offset, e))
        })
    }

    pub fn set_string(&mut self, offset: usize, value: &str) -> Result<()> {
        let len = i32::try_from(value.len())
            .map_err(|_| GraniteError::Page(format!("string of {} bytes is too long", value.len())))?;
        let needed = Self::max_length(value.len());
        self.check(offset, needed)?;
        let mut buf = &mut self.data[offset..offset + needed];
        buf.put_i32(len);
        buf.put_slice(value.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_page_is_zeroed() {
        let page = Page::new(64);
        assert_eq!(page.size(), 64);
        assert_eq!(page.get_int(0).unwrap(), 0);
        assert_eq!(page.get_string(8).unwrap(), "");
    }

    #[test]
    fn test_int_is_big_endian() {
        let mut page = Page::new(16);
        page.set_int(4, 0x01020304).unwrap();
        assert_eq!(&page.contents()[4..8], &[1, 2, 3, 4]);
        assert_eq!(page.get_int(4).unwrap(), 0x01020304);
    }

    #[test]
    fn test_negative_int() {
        let mut page = Page::new(16);
        page.set_int(0, -42).unwrap();
        assert_eq!(page.get_int(0).unwrap(), -42);
    }

    #[test]
    fn test_string_layout() {
        let mut page = Page::new(32);
        page.set_string(10, "abc").unwrap();
        assert_eq!(page.get_int(10).unwrap(), 3);
        assert_eq!(&page.contents()[14..17], b"abc");
        assert_eq!(page.get_string(10).unwrap(), "abc");
    }

    #[test]
    fn test_shorter_string_overwrites_length() {
        let mut page = Page::new(32);
        page.set_string(0, "longer").unwrap();
        page.set_string(0, "xy").unwrap();
        assert_eq!(page.get_string(0).unwrap(), "xy");
    }

    #[test]
    fn test_out_of_bounds_int() {
        let mut page = Page::new(8);
        assert!(page.get_int(5).is_err());
        assert!(page.set_int(usize::MAX - 1, 1).is_err());
        assert!(page.set_int(4, 1).is_ok());
    }

    #[test]
    fn test_out_of_bounds_string() {
        let mut page = Page::new(8);
        assert!(page.set_string(0, "too long").is_err());
        // A bogus length prefix must not read past the page
        page.set_int(0, 100).unwrap();
        assert!(page.get_string(0).is_err());
        page.set_int(0, -1).unwrap();
        assert!(page.get_string(0).is_err());
    }
}
