//! Growable byte regions with file-offset addressing.

use crate::error::Error;
use crate::error::Result;

/// Contiguous byte region backing a read window.
///
/// The buffer tracks `begin_offset`, the absolute file offset of its first
/// byte, so a window over the middle of a remote file can be addressed in
/// file coordinates. Callers provide their own synchronization.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    begin_offset: u64,
}

impl Buffer {
    /// An empty buffer with no allocation behind it.
    pub fn new() -> Self {
        Buffer {
            data: Vec::new(),
            begin_offset: 0,
        }
    }

    /// Number of bytes currently held.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no bytes are held.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Absolute file offset of the first held byte.
    pub fn begin_offset(&self) -> u64 {
        self.begin_offset
    }

    /// Absolute file offset one past the last held byte.
    pub fn end_offset(&self) -> u64 {
        self.begin_offset + self.data.len() as u64
    }

    /// The held bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append bytes, growing the allocation as needed.
    ///
    /// Growth failure is reported instead of aborting the process: the write
    /// pipeline turns it into `ENOMEM` on the offending call.
    pub fn add_mem(&mut self, bytes: &[u8]) -> Result<()> {
        self.data
            .try_reserve(bytes.len())
            .map_err(|_| Error::OutOfMemory)?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Drop all contents, retaining capacity. `begin_offset` is untouched;
    /// use [`Buffer::restart_at`] when repositioning a window.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Empty the buffer and reposition it at `offset`.
    pub fn restart_at(&mut self, offset: u64) {
        self.data.clear();
        self.begin_offset = offset;
    }

    /// Slide the window forward by discarding the first `n` bytes in place.
    ///
    /// `end_offset` is unchanged; `begin_offset` advances by `n`. Capacity is
    /// retained so a hot window does not reallocate.
    pub fn slide(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
        self.begin_offset += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_without_allocation() {
        let buf = Buffer::new();
        assert!(buf.is_empty());
        assert_eq!(buf.begin_offset(), 0);
        assert_eq!(buf.end_offset(), 0);
        assert_eq!(buf.data.capacity(), 0);
    }

    #[test]
    fn append_tracks_end_offset() {
        let mut buf = Buffer::new();
        buf.restart_at(100);
        buf.add_mem(b"hello").unwrap();
        buf.add_mem(b" world").unwrap();
        assert_eq!(buf.begin_offset(), 100);
        assert_eq!(buf.end_offset(), 111);
        assert_eq!(buf.as_slice(), b"hello world");
    }

    #[test]
    fn clear_retains_capacity() {
        let mut buf = Buffer::new();
        buf.add_mem(&[0u8; 4096]).unwrap();
        let cap = buf.data.capacity();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.data.capacity(), cap);
    }

    #[test]
    fn restart_repositions() {
        let mut buf = Buffer::new();
        buf.add_mem(b"stale").unwrap();
        buf.restart_at(9000);
        assert!(buf.is_empty());
        assert_eq!(buf.begin_offset(), 9000);
        assert_eq!(buf.end_offset(), 9000);
    }

    #[test]
    fn slide_preserves_end_offset() {
        let mut buf = Buffer::new();
        buf.restart_at(50);
        buf.add_mem(b"abcdefghij").unwrap();
        let end = buf.end_offset();
        buf.slide(4);
        assert_eq!(buf.end_offset(), end);
        assert_eq!(buf.begin_offset(), 54);
        assert_eq!(buf.as_slice(), b"efghij");
    }

    #[test]
    fn slide_past_len_empties() {
        let mut buf = Buffer::new();
        buf.add_mem(b"ab").unwrap();
        buf.slide(10);
        assert!(buf.is_empty());
        assert_eq!(buf.begin_offset(), 2);
    }
}
