//! Byte sources and sinks used by the readers and writers.
//!
//! Readers consume a [`SeekableSource`]: a bounded, random-access view over
//! some storage with position tracking and short-read semantics. Writers emit
//! into an [`OutputSink`], which is either a plain file, an in-memory buffer or
//! the [`CircularFileWriter`] when rewriting a file in place.
//!
//! Sources also carry a release watermark. A writer that copies sample data
//! knows which bytes it will never read again and publishes that through
//! [`SeekableSource::release`]; the circular writer uses the lowest watermark
//! of all live sources as its safe offset.

mod chunk;
mod circular;
mod memory;
mod sink;

pub use chunk::{ChunkFileSource, ProgressTracker, SourceProgress};
pub use circular::{
    CircularFileWriter, CircularOptions, HoldDecision, OffsetChecker, WriteErrorHandler,
    WriteFault, DEFAULT_STALL_LIMIT, NOTIFY_BYTES_INTERVAL, QUEUE_BUFFER_SIZE,
    THRESHOLD_AUX_LENGTH,
};
pub use memory::MemorySource;
pub use sink::{FileSink, ProgressCallback, ProgressReporter};

use crate::{Error, Result};

/// Random-access byte source bounded to a logical range.
///
/// Positions are always relative to the start of the range and stay within
/// `[0, length]`.
pub trait SeekableSource {
    /// Read up to `buf.len()` bytes. Returns 0 at the end of the range.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Move to an absolute position within the range.
    fn seek_to(&mut self, position: u64) -> Result<()>;

    /// Current position relative to the start of the range.
    fn position(&self) -> u64;

    /// Length of the logical range.
    fn length(&self) -> u64;

    /// Release the underlying handle. Idempotent.
    fn dispose(&mut self);

    /// Whether `dispose()` was called.
    fn is_disposed(&self) -> bool;

    /// Declare that bytes before `upto` will not be read again.
    fn release(&mut self, _upto: u64) {}

    /// Skip forward, clamped to the end of the range. Returns the amount skipped.
    fn skip(&mut self, amount: u64) -> Result<u64> {
        let position = self.position();
        let target = position.saturating_add(amount).min(self.length());
        self.seek_to(target)?;
        Ok(target - position)
    }

    /// Equivalent to `seek_to(0)`.
    fn rewind(&mut self) -> Result<()> {
        self.seek_to(0)
    }

    /// Bytes left until the end of the range.
    fn available(&self) -> u64 {
        self.length().saturating_sub(self.position())
    }

    /// Fill `buf` completely or fail with a malformed container error.
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let read = self.read(&mut buf[filled..])?;
            if read == 0 {
                return Err(Error::malformed(format!(
                    "unexpected end of data at {} ({} bytes missing)",
                    self.position(),
                    buf.len() - filled
                )));
            }
            filled += read;
        }
        Ok(())
    }

    /// Read `len` bytes into a new vector.
    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; len];
        self.read_fully(&mut data)?;
        Ok(data)
    }
}

/// Destination for muxer output.
pub trait OutputSink {
    /// Write the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Number of bytes written so far.
    fn position(&self) -> u64;
}

impl OutputSink for Vec<u8> {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.extend_from_slice(buf);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.len() as u64
    }
}

/// Read the first four bytes of a source and rewind it.
///
/// Returns `None` when the source holds fewer than four bytes.
pub fn peek_signature<S: SeekableSource + ?Sized>(source: &mut S) -> Result<Option<[u8; 4]>> {
    source.rewind()?;
    if source.length() < 4 {
        return Ok(None);
    }
    let mut magic = [0u8; 4];
    source.read_fully(&mut magic)?;
    source.rewind()?;
    Ok(Some(magic))
}

/// Copy `len` bytes starting at `offset` of `source` into `sink`.
///
/// `buffer` is caller-owned scratch space reused across calls.
pub fn copy_range<S, O>(
    source: &mut S,
    offset: u64,
    len: u64,
    sink: &mut O,
    buffer: &mut [u8],
) -> Result<()>
where
    S: SeekableSource + ?Sized,
    O: OutputSink + ?Sized,
{
    if source.position() != offset {
        source.seek_to(offset)?;
    }
    let mut remaining = len;
    while remaining > 0 {
        let step = remaining.min(buffer.len() as u64) as usize;
        source.read_fully(&mut buffer[..step])?;
        sink.write_all(&buffer[..step])?;
        remaining -= step as u64;
    }
    Ok(())
}

/// Like [`copy_range`], but releases the source after every buffer.
///
/// The watermark published is the read position capped at `floor`, the
/// lowest offset still needed once this range is done.
pub fn copy_range_releasing<S, O>(
    source: &mut S,
    offset: u64,
    len: u64,
    sink: &mut O,
    buffer: &mut [u8],
    floor: u64,
) -> Result<()>
where
    S: SeekableSource + ?Sized,
    O: OutputSink + ?Sized,
{
    if source.position() != offset {
        source.seek_to(offset)?;
    }
    let mut remaining = len;
    while remaining > 0 {
        let step = remaining.min(buffer.len() as u64) as usize;
        source.read_fully(&mut buffer[..step])?;
        source.release(source.position().min(floor));
        sink.write_all(&buffer[..step])?;
        remaining -= step as u64;
    }
    Ok(())
}
