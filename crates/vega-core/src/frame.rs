//! Bounds-checked little-endian reads over a byte buffer.
//!
//! [`FrameReader`] is a forward-only cursor. Every read either returns the
//! decoded value and advances, or fails with [`FrameError::OutOfRange`] and
//! leaves the cursor where it was.

use thiserror::Error;

/// Errors produced while reading a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The read needs more bytes than remain in the buffer.
    #[error("read of {requested} bytes at offset {position} exceeds remaining {remaining}")]
    OutOfRange {
        /// Bytes requested by the read.
        requested: usize,
        /// Cursor position at the time of the read.
        position: usize,
        /// Bytes left after the cursor.
        remaining: usize,
    },
}

/// Result type for frame reads.
pub type FrameResult<T> = std::result::Result<T, FrameError>;

/// Forward-only cursor over an immutable byte slice.
#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    /// Wrap `data` with the cursor at offset zero.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Current cursor offset.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Bytes left after the cursor.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Returns the next `n` bytes and advances past them.
    ///
    /// # Errors
    ///
    /// [`FrameError::OutOfRange`] if fewer than `n` bytes remain.
    pub fn read_bytes(&mut self, n: usize) -> FrameResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(FrameError::OutOfRange {
                requested: n,
                position: self.position,
                remaining: self.remaining(),
            });
        }
        let start = self.position;
        self.position += n;
        Ok(&self.data[start..self.position])
    }

    /// Advances past `n` bytes without interpreting them.
    ///
    /// # Errors
    ///
    /// [`FrameError::OutOfRange`] if fewer than `n` bytes remain.
    pub fn skip(&mut self, n: usize) -> FrameResult<()> {
        self.read_bytes(n).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self) -> FrameResult<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Reads one unsigned byte.
    ///
    /// # Errors
    ///
    /// [`FrameError::OutOfRange`] on an exhausted buffer.
    pub fn read_u8(&mut self) -> FrameResult<u8> {
        let [b] = self.read_array::<1>()?;
        Ok(b)
    }

    /// Reads an unsigned 16-bit little-endian value.
    ///
    /// # Errors
    ///
    /// [`FrameError::OutOfRange`] if fewer than 2 bytes remain.
    pub fn read_u16_le(&mut self) -> FrameResult<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Reads a signed 32-bit little-endian value.
    ///
    /// # Errors
    ///
    /// [`FrameError::OutOfRange`] if fewer than 4 bytes remain.
    pub fn read_i32_le(&mut self) -> FrameResult<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    /// Reads the same 4 bytes as [`read_i32_le`](Self::read_i32_le) as an
    /// unsigned value. Never sign-extends.
    ///
    /// # Errors
    ///
    /// [`FrameError::OutOfRange`] if fewer than 4 bytes remain.
    pub fn read_u32_le(&mut self) -> FrameResult<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// Reads an IEEE-754 single precision value in little-endian order.
    ///
    /// # Errors
    ///
    /// [`FrameError::OutOfRange`] if fewer than 4 bytes remain.
    pub fn read_f32_le(&mut self) -> FrameResult<f32> {
        self.read_array().map(f32::from_le_bytes)
    }
}
