use bytes::BytesMut;

use crate::error::{MarshalError, Result};

/// Contiguous, resizable byte storage with a read cursor.
///
/// Growth is capped by the configured maximum message size, and the cap is
/// checked before any allocation or copy so a hostile declared length can
/// never trigger an oversized transient allocation. Every multi-byte read
/// validates the full width against the remaining bytes before consuming
/// any of them.
///
/// Invariant: `pos <= len` at all times.
#[derive(Debug)]
pub struct Buffer {
    data: BytesMut,
    pos: usize,
    max_size: usize,
}

impl Buffer {
    /// Create an empty buffer capped at `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            data: BytesMut::new(),
            pos: 0,
            max_size,
        }
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read cursor position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Configured maximum message size.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bytes between the cursor and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// The buffer contents as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Grow (or shrink) to `new_len` bytes, zero-filling any new tail.
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        if new_len > self.max_size {
            return Err(MarshalError::MemoryLimitExceeded {
                requested: new_len,
                max: self.max_size,
            });
        }
        self.data.resize(new_len, 0);
        Ok(())
    }

    /// Extend by `n` zero bytes, returning the offset where they begin.
    pub fn expand(&mut self, n: usize) -> Result<usize> {
        let old_len = self.data.len();
        self.resize(old_len + n)?;
        Ok(old_len)
    }

    /// Append raw bytes, respecting the size cap.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let new_len = self.data.len() + bytes.len();
        if new_len > self.max_size {
            return Err(MarshalError::MemoryLimitExceeded {
                requested: new_len,
                max: self.max_size,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Truncate to zero and rewind the cursor, keeping allocated capacity
    /// so the buffer can be reused for the next message.
    pub fn reset(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    /// Move the cursor to an absolute position.
    ///
    /// Callers must have validated `pos` against the buffer length; this is
    /// only used with offsets derived from already-checked region headers.
    pub(crate) fn seek(&mut self, pos: usize) {
        debug_assert!(pos <= self.data.len());
        self.pos = pos;
    }

    /// Consume exactly `n` bytes starting at the cursor.
    ///
    /// The bounds check covers the full width atomically: on failure the
    /// cursor has not moved and no byte was consumed.
    pub fn read_slice(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(MarshalError::UnmarshalOutOfBounds {
                position: self.pos,
                requested: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Consume exactly `N` bytes as a fixed-width array.
    pub fn fetch<const N: usize>(&mut self) -> Result<[u8; N]> {
        // Length is checked by read_slice, so the conversion cannot fail.
        Ok(self.read_slice(N)?.try_into().unwrap())
    }

    /// Overwrite 4 bytes in place at `offset`.
    ///
    /// Used to patch a placeholder length field written earlier; `offset`
    /// always comes from recording our own placeholder write.
    pub(crate) fn patch4(&mut self, offset: usize, bytes: [u8; 4]) {
        self.data[offset..offset + 4].copy_from_slice(&bytes);
    }
}
