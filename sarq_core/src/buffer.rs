//! Bounded read buffer sitting between a source file and the encoder.

use std::io::Read;

/// A fixed-capacity byte buffer with a fill cursor and an extraction cursor.
///
/// Bytes enter through [`fill`](Buffer::fill) (read from a source) and leave
/// through [`pending`](Buffer::pending) + [`consume`](Buffer::consume) (handed
/// to the encoder). Invariant at all times: `extracted <= filled <= capacity`.
/// Once every filled byte has been consumed the cursors snap back to zero so
/// the capacity is reused for the next fill.
#[derive(Debug)]
pub(crate) struct Buffer {
    data: Box<[u8]>,
    filled: usize,
    extracted: usize,
}

impl Buffer {
    /// Create a buffer with the given fixed capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
            extracted: 0,
        }
    }

    /// The fixed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// True when no unconsumed bytes remain.
    pub fn is_empty(&self) -> bool {
        self.extracted == self.filled
    }

    /// True when the fill cursor has reached capacity.
    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    /// Number of bytes filled but not yet consumed.
    pub fn len(&self) -> usize {
        self.filled - self.extracted
    }

    /// Read from `source` into the free tail of the buffer.
    ///
    /// Returns the number of bytes read; 0 means the source is at end-of-data
    /// (the buffer must not be full when calling this, or 0 is meaningless).
    pub fn fill<R: Read>(&mut self, source: &mut R) -> std::io::Result<usize> {
        let n = source.read(&mut self.data[self.filled..])?;
        self.filled += n;
        self.check_invariant();
        Ok(n)
    }

    /// The filled-but-unconsumed slice, in fill order.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.extracted..self.filled]
    }

    /// Mark `n` pending bytes as handed off.
    ///
    /// Resets both cursors to zero once the buffer is fully drained.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len(), "consumed more than was pending");
        self.extracted += n;
        if self.extracted >= self.filled {
            self.clear();
        }
        self.check_invariant();
    }

    /// Drop any pending bytes and reset both cursors.
    pub fn clear(&mut self) {
        self.filled = 0;
        self.extracted = 0;
    }

    fn check_invariant(&self) {
        debug_assert!(self.extracted <= self.filled);
        debug_assert!(self.filled <= self.data.len());
    }
}
