//! In-memory source.

use super::SeekableSource;
use crate::{Error, Result};
use bytes::Bytes;

/// Source backed by a shared byte buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
    position: u64,
    released: u64,
    disposed: bool,
}

impl MemorySource {
    /// Create a source over the given bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
            released: 0,
            disposed: false,
        }
    }

    /// Highest offset passed to `release()`.
    pub fn released(&self) -> u64 {
        self.released
    }

    /// Underlying bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl SeekableSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        let start = self.position as usize;
        let count = buf.len().min(self.data.len() - start);
        buf[..count].copy_from_slice(&self.data[start..start + count]);
        self.position += count as u64;
        Ok(count)
    }

    fn seek_to(&mut self, position: u64) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        if position > self.length() {
            return Err(Error::OutOfRange {
                position,
                length: self.length(),
            });
        }
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn dispose(&mut self) {
        self.disposed = true;
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn release(&mut self, upto: u64) {
        self.released = self.released.max(upto.min(self.length()));
    }
}
