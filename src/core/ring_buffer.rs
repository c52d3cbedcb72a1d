//! # Ring Buffer
//!
//! Growable circular byte buffer used as a connection's read buffer.
//!
//! Bytes are read from the socket straight into the contiguous free region
//! after the write cursor, and whole frames are taken from the front once
//! they are fully buffered. Capacity only ever doubles, and growing
//! re-linearizes the contents so the read cursor starts at zero.
//!
//! Storage is allocated on first use, so idle outgoing connections do not
//! pay for a read buffer they never fill.

use std::io;

#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    start: usize,
    len: usize,
}

impl RingBuffer {
    /// Create a buffer with the given initial capacity (at least 1 byte).
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity: capacity.max(1),
            start: 0,
            len: 0,
        }
    }

    /// Buffered byte count.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free byte count.
    #[inline]
    pub fn free(&self) -> usize {
        self.capacity - self.len
    }

    fn ensure_allocated(&mut self) {
        if self.buf.len() != self.capacity {
            self.buf.resize(self.capacity, 0);
        }
    }

    /// Double the capacity until it is at least `min`.
    pub fn grow(&mut self, min: usize) {
        let mut next = self.capacity;
        while next < min {
            next = next.saturating_mul(2);
        }
        if next == self.capacity {
            return;
        }

        let mut fresh = vec![0u8; next];
        if !self.buf.is_empty() {
            self.copy_out(&mut fresh[..self.len]);
        }
        self.buf = fresh;
        self.capacity = next;
        self.start = 0;
    }

    /// Contiguous free region after the write cursor.
    fn free_region(&mut self) -> &mut [u8] {
        self.ensure_allocated();
        if self.len == self.capacity {
            return &mut [];
        }
        if self.len == 0 {
            self.start = 0;
        }
        let end = (self.start + self.len) % self.capacity;
        if end >= self.start {
            &mut self.buf[end..]
        } else {
            &mut self.buf[end..self.start]
        }
    }

    /// Fill the contiguous free region with `f` and commit what it reports.
    ///
    /// `f` receives an empty slice only when the buffer is full.
    pub fn fill_with<F>(&mut self, f: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let region = self.free_region();
        let room = region.len();
        let n = f(region)?;
        debug_assert!(n <= room);
        self.len += n.min(room);
        Ok(n)
    }

    /// Append `data`, growing when it does not fit.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        if data.len() > self.free() {
            self.grow(self.len + data.len());
        }
        let mut rest = data;
        while !rest.is_empty() {
            let region = self.free_region();
            let n = region.len().min(rest.len());
            region[..n].copy_from_slice(&rest[..n]);
            self.len += n;
            rest = &rest[n..];
        }
    }

    fn copy_out(&self, out: &mut [u8]) {
        let n = out.len();
        let first = n.min(self.capacity - self.start);
        out[..first].copy_from_slice(&self.buf[self.start..self.start + first]);
        if first < n {
            out[first..].copy_from_slice(&self.buf[..n - first]);
        }
    }

    /// Copy the first `out.len()` buffered bytes without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> bool {
        if out.len() > self.len {
            return false;
        }
        if !out.is_empty() {
            self.copy_out(out);
        }
        true
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.len -= n;
        self.start = if self.len == 0 {
            0
        } else {
            (self.start + n) % self.capacity
        };
    }

    /// Remove and return the first `n` bytes, or `None` if fewer are buffered.
    pub fn take(&mut self, n: usize) -> Option<Vec<u8>> {
        if n > self.len {
            return None;
        }
        let mut out = vec![0u8; n];
        if n > 0 {
            self.copy_out(&mut out);
        }
        self.consume(n);
        Some(out)
    }
}
