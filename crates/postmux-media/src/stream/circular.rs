//! In-place writer for same-file post-processing.
//!
//! The output is written over the beginning of the file its sources are
//! still reading from. Before every write the checker is polled for the safe
//! offset: the lowest absolute offset some source still needs. Bytes that
//! would land at or beyond it go to an auxiliary scratch file instead and are
//! copied into place once the readers have moved on (or on
//! [`CircularFileWriter::finalize`], when nothing is read anymore).
//!
//! The output is a single sequential stream: the first `committed` bytes are
//! in the target file and the next `pending` bytes sit in the scratch file.

use super::sink::{ProgressCallback, ProgressReporter};
use super::OutputSink;
use crate::{Error, Result};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tempfile::NamedTempFile;

/// Size of the buffer used when moving scratch data into the target.
pub const QUEUE_BUFFER_SIZE: usize = 8 * 1024;
/// Default progress notification interval.
pub const NOTIFY_BYTES_INTERVAL: u64 = 128 * 1024;
/// Minimum amount of scratch data moved at once while readers are active.
///
/// Also the amount that may be buffered at an unchanged safe offset before
/// writes start counting towards a stall.
pub const THRESHOLD_AUX_LENGTH: u64 = 3 * 1024 * 1024;
/// Blocked writes at an unchanged safe offset before a stall is reported.
pub const DEFAULT_STALL_LIMIT: u32 = 16;

/// Returns the safe offset, or `None` when the whole file may be written.
pub type OffsetChecker = Box<dyn FnMut() -> Option<u64> + Send>;

/// Handler deciding whether a failed or stalled write should be retried.
///
/// May block until an external decision arrives.
pub type WriteErrorHandler = Box<dyn FnMut(&WriteFault<'_>) -> HoldDecision + Send>;

/// Reason the writer cannot make progress.
#[derive(Debug)]
pub enum WriteFault<'a> {
    /// The safe offset did not advance while scratch data kept growing.
    Stalled { safe_offset: u64, pending: u64 },
    /// Writing to the target or scratch file failed.
    Io(&'a io::Error),
}

/// Decision returned by a [`WriteErrorHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldDecision {
    Retry,
    Abort,
}

/// Tunables of the circular writer.
#[derive(Debug, Clone)]
pub struct CircularOptions {
    pub aux_threshold: u64,
    pub stall_limit: u32,
    pub progress_interval: u64,
}

impl Default for CircularOptions {
    fn default() -> Self {
        Self {
            aux_threshold: THRESHOLD_AUX_LENGTH,
            stall_limit: DEFAULT_STALL_LIMIT,
            progress_interval: NOTIFY_BYTES_INTERVAL,
        }
    }
}

#[derive(Debug, Default)]
struct StallState {
    last_offset: Option<u64>,
    /// Bytes sent to scratch since the safe offset last moved.
    buffered: u64,
    writes: u32,
    resolved: bool,
}

/// Writer that rewrites a file in place without overtaking its readers.
pub struct CircularFileWriter {
    out: Option<File>,
    aux: Option<NamedTempFile>,
    checker: OffsetChecker,
    progress: Option<ProgressReporter>,
    on_write_error: Option<WriteErrorHandler>,
    options: CircularOptions,
    committed: u64,
    aux_head: u64,
    aux_tail: u64,
    stall: StallState,
    buffer: Vec<u8>,
}

impl CircularFileWriter {
    /// Create a writer over `target`, overflowing into `scratch`.
    ///
    /// Output starts at offset 0 of `target`.
    pub fn new(target: File, scratch: NamedTempFile, checker: OffsetChecker) -> Self {
        Self {
            out: Some(target),
            aux: Some(scratch),
            checker,
            progress: None,
            on_write_error: None,
            options: CircularOptions::default(),
            committed: 0,
            aux_head: 0,
            aux_tail: 0,
            stall: StallState::default(),
            buffer: vec![0u8; QUEUE_BUFFER_SIZE],
        }
    }

    pub fn with_options(mut self, options: CircularOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(ProgressReporter::new(self.options.progress_interval, callback));
        self
    }

    pub fn with_write_error_handler(mut self, handler: WriteErrorHandler) -> Self {
        self.on_write_error = Some(handler);
        self
    }

    /// Bytes already placed in the target file.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Bytes waiting in the scratch file.
    pub fn pending(&self) -> u64 {
        self.aux_tail - self.aux_head
    }

    /// Write `buf` at the end of the output.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.out.is_none() {
            return Err(Error::Disposed);
        }
        if buf.is_empty() {
            return Ok(());
        }

        let limit = (self.checker)();
        if let Some(offset) = limit {
            if offset < self.committed {
                return Err(Error::InvalidSafeOffset {
                    offset,
                    committed: self.committed,
                });
            }
        }

        let committed = self.committed;
        self.drain(limit, false)?;

        let mut rest = buf;
        if self.pending() == 0 {
            let direct = self.room(limit).min(rest.len() as u64) as usize;
            if direct > 0 {
                self.write_out(&rest[..direct])?;
                rest = &rest[direct..];
            }
        }
        if !rest.is_empty() {
            self.write_aux(rest)?;
        }

        let placed = self.committed > committed;
        self.track_stall(limit, rest.len() as u64, placed)?;

        let done = self.committed + self.pending();
        if let Some(progress) = self.progress.as_mut() {
            progress.update(done);
        }
        Ok(())
    }

    /// Move all scratch data into place, truncate the target and return its length.
    pub fn finalize(mut self) -> Result<u64> {
        if self.out.is_none() {
            return Err(Error::Disposed);
        }
        self.drain(None, true)?;

        let length = self.committed;
        if let Some(out) = self.out.as_mut() {
            out.flush()?;
            out.set_len(length)?;
            out.sync_all()?;
        }
        if let Some(progress) = self.progress.as_mut() {
            progress.finish(length);
        }
        tracing::debug!(length, "circular writer finalized");

        self.dispose();
        Ok(length)
    }

    /// Release both files and delete the scratch file. Idempotent.
    pub fn dispose(&mut self) {
        self.out = None;
        if let Some(aux) = self.aux.take() {
            if let Err(err) = aux.close() {
                tracing::warn!("Failed to remove scratch file: {}", err);
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.out.is_none()
    }

    fn room(&self, limit: Option<u64>) -> u64 {
        match limit {
            Some(offset) => offset.saturating_sub(self.committed),
            None => u64::MAX,
        }
    }

    /// Copy scratch data into the target as far as the safe offset allows.
    fn drain(&mut self, limit: Option<u64>, force: bool) -> Result<()> {
        let pending = self.pending();
        if pending == 0 {
            return Ok(());
        }

        let room = self.room(limit);
        let amount = if force || limit.is_none() {
            pending
        } else if room >= pending && pending >= self.options.aux_threshold {
            pending
        } else if room >= self.options.aux_threshold {
            room.min(pending)
        } else {
            0
        };
        if amount == 0 {
            return Ok(());
        }

        tracing::trace!(amount, pending, committed = self.committed, "draining scratch data");

        let mut buffer = std::mem::take(&mut self.buffer);
        let mut remaining = amount;
        let result: Result<()> = (|| {
            while remaining > 0 {
                let step = remaining.min(buffer.len() as u64) as usize;
                let aux = self.aux.as_mut().ok_or(Error::Disposed)?;
                let file = aux.as_file_mut();
                file.seek(SeekFrom::Start(self.aux_head))?;
                file.read_exact(&mut buffer[..step])?;
                self.aux_head += step as u64;
                self.write_out(&buffer[..step])?;
                remaining -= step as u64;
            }
            Ok(())
        })();
        self.buffer = buffer;
        result?;

        if self.pending() == 0 {
            self.aux_head = 0;
            self.aux_tail = 0;
            if let Some(aux) = self.aux.as_mut() {
                let file = aux.as_file_mut();
                if file.metadata()?.len() > self.options.aux_threshold {
                    file.set_len(self.options.aux_threshold)?;
                }
            }
        }
        Ok(())
    }

    fn write_out(&mut self, data: &[u8]) -> Result<()> {
        let position = self.committed;
        let out = self.out.as_mut().ok_or(Error::Disposed)?;
        write_proof(out, position, data, &mut self.on_write_error)?;
        self.committed += data.len() as u64;
        Ok(())
    }

    fn write_aux(&mut self, data: &[u8]) -> Result<()> {
        let position = self.aux_tail;
        let aux = self.aux.as_mut().ok_or(Error::Disposed)?;
        write_proof(aux.as_file_mut(), position, data, &mut self.on_write_error)?;
        self.aux_tail += data.len() as u64;
        Ok(())
    }

    /// A write counts as blocked when it placed nothing in the target while
    /// at least `aux_threshold` bytes were buffered at the same safe offset.
    fn track_stall(&mut self, limit: Option<u64>, spilled: u64, placed: bool) -> Result<()> {
        let pending = self.pending();
        let safe_offset = match limit {
            Some(offset) if pending > 0 => offset,
            _ => {
                self.stall = StallState::default();
                return Ok(());
            }
        };

        if self.stall.last_offset != Some(safe_offset) {
            self.stall = StallState {
                last_offset: Some(safe_offset),
                ..StallState::default()
            };
        }
        self.stall.buffered += spilled;
        if placed || self.stall.buffered < self.options.aux_threshold {
            return Ok(());
        }

        self.stall.writes += 1;
        if self.stall.writes < self.options.stall_limit || self.stall.resolved {
            return Ok(());
        }
        let Some(handler) = self.on_write_error.as_mut() else {
            return Ok(());
        };

        tracing::warn!(safe_offset, pending, "circular writer stalled, requesting hold");
        match handler(&WriteFault::Stalled {
            safe_offset,
            pending,
        }) {
            HoldDecision::Retry => {
                self.stall.resolved = true;
                Ok(())
            }
            HoldDecision::Abort => Err(Error::WriteHold(format!(
                "reader stalled at offset {} with {} bytes pending",
                safe_offset, pending
            ))),
        }
    }
}

impl OutputSink for CircularFileWriter {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.write(buf)
    }

    fn position(&self) -> u64 {
        self.committed + self.pending()
    }
}

impl Drop for CircularFileWriter {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Positioned write, retried for as long as the handler asks to.
fn write_proof(
    file: &mut File,
    position: u64,
    data: &[u8],
    handler: &mut Option<WriteErrorHandler>,
) -> Result<()> {
    loop {
        let attempt = file
            .seek(SeekFrom::Start(position))
            .and_then(|_| file.write_all(data));
        let err = match attempt {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let retry = match handler.as_mut() {
            Some(handler) => handler(&WriteFault::Io(&err)) == HoldDecision::Retry,
            None => false,
        };
        if !retry {
            return Err(err.into());
        }
        tracing::debug!("retrying write at {} after: {}", position, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::fs::OpenOptions;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    const UNTOUCHED: u8 = 0xAA;

    fn prefilled(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![UNTOUCHED; len]).unwrap();
        file.flush().unwrap();
        file
    }

    fn open_rw(path: &Path) -> File {
        OpenOptions::new().read(true).write(true).open(path).unwrap()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 200) as u8).collect()
    }

    fn options(aux_threshold: u64, stall_limit: u32) -> CircularOptions {
        CircularOptions {
            aux_threshold,
            stall_limit,
            progress_interval: NOTIFY_BYTES_INTERVAL,
        }
    }

    #[test]
    fn test_unbounded_checker_writes_directly() {
        let target = prefilled(16);
        let writer = CircularFileWriter::new(
            open_rw(target.path()),
            NamedTempFile::new().unwrap(),
            Box::new(|| None),
        );
        let mut writer = writer;
        writer.write(b"abc").unwrap();
        writer.write(b"def").unwrap();
        assert_eq!(writer.pending(), 0);

        assert_eq!(writer.finalize().unwrap(), 6);
        assert_eq!(std::fs::read(target.path()).unwrap(), b"abcdef");
    }

    #[test]
    fn test_overflow_goes_to_scratch_until_finalize() {
        let target = prefilled(64);
        let mut writer = CircularFileWriter::new(
            open_rw(target.path()),
            NamedTempFile::new().unwrap(),
            Box::new(|| Some(16)),
        );
        let data = payload(40);
        writer.write(&data).unwrap();

        assert_eq!(writer.committed(), 16);
        assert_eq!(writer.pending(), 24);
        let on_disk = std::fs::read(target.path()).unwrap();
        assert_eq!(&on_disk[..16], &data[..16]);
        assert!(on_disk[16..].iter().all(|&b| b == UNTOUCHED));

        assert_eq!(writer.finalize().unwrap(), 40);
        assert_eq!(std::fs::read(target.path()).unwrap(), data);
    }

    #[test]
    fn test_never_writes_past_safe_offset() {
        let target = prefilled(4096);
        let trajectory = [0u64, 0, 100, 100, 350, 900, 900, 2000, 2500, 4000];
        let step = Arc::new(AtomicU64::new(0));
        let observed = Arc::new(AtomicU64::new(0));

        let checker_step = step.clone();
        let checker_observed = observed.clone();
        let mut writer = CircularFileWriter::new(
            open_rw(target.path()),
            NamedTempFile::new().unwrap(),
            Box::new(move || {
                let i = checker_step.load(Ordering::SeqCst) as usize;
                let offset = trajectory[i.min(trajectory.len() - 1)];
                checker_observed.store(offset, Ordering::SeqCst);
                Some(offset)
            }),
        )
        .with_options(options(64, DEFAULT_STALL_LIMIT));

        let data = payload(3000);
        for (i, chunk) in data.chunks(300).enumerate() {
            step.store(i as u64, Ordering::SeqCst);
            writer.write(chunk).unwrap();

            let limit = observed.load(Ordering::SeqCst) as usize;
            let on_disk = std::fs::read(target.path()).unwrap();
            assert!(
                on_disk[limit..].iter().all(|&b| b == UNTOUCHED),
                "write {} touched bytes beyond {}",
                i,
                limit
            );
        }

        assert_eq!(writer.finalize().unwrap(), 3000);
        assert_eq!(std::fs::read(target.path()).unwrap(), data);
    }

    #[test]
    fn test_stall_requests_hold_once_and_recovers() {
        let data = payload(64 * 1024);

        // Reference output with a checker that never limits.
        let reference = prefilled(data.len());
        let mut writer = CircularFileWriter::new(
            open_rw(reference.path()),
            NamedTempFile::new().unwrap(),
            Box::new(|| None),
        );
        for chunk in data.chunks(1024) {
            writer.write(chunk).unwrap();
        }
        writer.finalize().unwrap();
        let expected = Sha256::digest(std::fs::read(reference.path()).unwrap());

        // Checker stuck at 0 for the first 40 writes, then jumps to the file length.
        let target = prefilled(data.len());
        let writes = Arc::new(AtomicU32::new(0));
        let holds = Arc::new(AtomicU32::new(0));
        let checker_writes = writes.clone();
        let handler_holds = holds.clone();
        let file_len = data.len() as u64;

        let mut writer = CircularFileWriter::new(
            open_rw(target.path()),
            NamedTempFile::new().unwrap(),
            Box::new(move || {
                if checker_writes.fetch_add(1, Ordering::SeqCst) < 40 {
                    Some(0)
                } else {
                    Some(file_len)
                }
            }),
        )
        .with_options(options(4 * 1024, 16))
        .with_write_error_handler(Box::new(move |fault| {
            assert!(matches!(fault, WriteFault::Stalled { safe_offset: 0, .. }));
            handler_holds.fetch_add(1, Ordering::SeqCst);
            HoldDecision::Retry
        }));

        for (i, chunk) in data.chunks(1024).enumerate() {
            writer.write(chunk).unwrap();
            if i < 40 {
                assert_eq!(writer.committed(), 0);
            }
        }
        assert_eq!(holds.load(Ordering::SeqCst), 1);

        writer.finalize().unwrap();
        let actual = Sha256::digest(std::fs::read(target.path()).unwrap());
        assert_eq!(hex::encode(actual), hex::encode(expected));
    }

    #[test]
    fn test_buffering_below_threshold_is_not_a_stall() {
        let target = prefilled(0);
        let holds = Arc::new(AtomicU32::new(0));
        let handler_holds = holds.clone();
        let mut writer = CircularFileWriter::new(
            open_rw(target.path()),
            NamedTempFile::new().unwrap(),
            Box::new(|| Some(0)),
        )
        .with_options(options(64 * 1024, 2))
        .with_write_error_handler(Box::new(move |_| {
            handler_holds.fetch_add(1, Ordering::SeqCst);
            HoldDecision::Abort
        }));

        // Many small writes at a fixed safe offset, all within the budget.
        for chunk in payload(60 * 1024).chunks(512) {
            writer.write(chunk).unwrap();
        }
        assert_eq!(holds.load(Ordering::SeqCst), 0);
        assert_eq!(writer.finalize().unwrap(), 60 * 1024);
    }

    #[test]
    fn test_moving_safe_offset_is_not_a_stall() {
        let target = prefilled(0);
        let offset = Arc::new(AtomicU64::new(0));
        let checker_offset = offset.clone();
        let mut writer = CircularFileWriter::new(
            open_rw(target.path()),
            NamedTempFile::new().unwrap(),
            Box::new(move || Some(checker_offset.fetch_add(1, Ordering::SeqCst))),
        )
        .with_options(options(256, 1))
        .with_write_error_handler(Box::new(|_| HoldDecision::Abort));

        // The reader creeps forward one byte per write while the writer spills.
        for chunk in payload(4096).chunks(64) {
            writer.write(chunk).unwrap();
        }
        assert!(writer.pending() > 0);
        assert_eq!(writer.finalize().unwrap(), 4096);
        assert_eq!(offset.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_abort_fails_with_write_hold() {
        let target = prefilled(32);
        let mut writer = CircularFileWriter::new(
            open_rw(target.path()),
            NamedTempFile::new().unwrap(),
            Box::new(|| Some(0)),
        )
        .with_options(options(4, 2))
        .with_write_error_handler(Box::new(|_| HoldDecision::Abort));

        writer.write(b"first").unwrap();
        let err = writer.write(b"second").unwrap_err();
        assert!(err.is_write_hold());
        assert!(std::fs::read(target.path())
            .unwrap()
            .iter()
            .all(|&b| b == UNTOUCHED));
    }

    #[test]
    fn test_io_error_is_retried_until_abort() {
        let target = prefilled(8);
        let mut read_only = File::open(target.path()).unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut handler: Option<WriteErrorHandler> = Some(Box::new(move |fault: &WriteFault<'_>| {
            assert!(matches!(fault, WriteFault::Io(_)));
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                HoldDecision::Retry
            } else {
                HoldDecision::Abort
            }
        }));

        let err = write_proof(&mut read_only, 0, b"data", &mut handler).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let err = write_proof(&mut read_only, 0, b"data", &mut None).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_partial_drain_when_reader_advances() {
        let target = prefilled(256);
        let limit = Arc::new(AtomicU64::new(0));
        let checker_limit = limit.clone();
        let mut writer = CircularFileWriter::new(
            open_rw(target.path()),
            NamedTempFile::new().unwrap(),
            Box::new(move || Some(checker_limit.load(Ordering::SeqCst))),
        )
        .with_options(options(32, DEFAULT_STALL_LIMIT));

        let data = payload(200);
        writer.write(&data[..100]).unwrap();
        assert_eq!(writer.pending(), 100);

        limit.store(48, Ordering::SeqCst);
        writer.write(&data[100..110]).unwrap();
        assert_eq!(writer.committed(), 48);
        assert_eq!(writer.pending(), 62);

        limit.store(256, Ordering::SeqCst);
        writer.write(&data[110..]).unwrap();
        assert_eq!(writer.committed(), 200);
        assert_eq!(writer.pending(), 0);

        assert_eq!(writer.finalize().unwrap(), 200);
        assert_eq!(std::fs::read(target.path()).unwrap(), data);
    }

    #[test]
    fn test_safe_offset_moving_backwards_is_rejected() {
        let target = prefilled(64);
        let limit = Arc::new(AtomicU64::new(32));
        let checker_limit = limit.clone();
        let mut writer = CircularFileWriter::new(
            open_rw(target.path()),
            NamedTempFile::new().unwrap(),
            Box::new(move || Some(checker_limit.load(Ordering::SeqCst))),
        );
        writer.write(&payload(20)).unwrap();
        limit.store(10, Ordering::SeqCst);
        assert!(matches!(
            writer.write(b"x"),
            Err(Error::InvalidSafeOffset {
                offset: 10,
                committed: 20
            })
        ));
    }

    #[test]
    fn test_dispose_removes_scratch_file() {
        let target = prefilled(8);
        let scratch = NamedTempFile::new().unwrap();
        let scratch_path = scratch.path().to_path_buf();
        let mut writer =
            CircularFileWriter::new(open_rw(target.path()), scratch, Box::new(|| Some(0)));
        writer.write(b"pending").unwrap();
        assert!(scratch_path.exists());

        writer.dispose();
        writer.dispose();
        assert!(!scratch_path.exists());
        assert!(matches!(writer.write(b"x"), Err(Error::Disposed)));
        assert!(std::fs::read(target.path())
            .unwrap()
            .iter()
            .all(|&b| b == UNTOUCHED));
    }

    #[test]
    fn test_progress_reports() {
        let target = prefilled(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut writer = CircularFileWriter::new(
            open_rw(target.path()),
            NamedTempFile::new().unwrap(),
            Box::new(|| None),
        )
        .with_options(CircularOptions {
            progress_interval: 1000,
            ..CircularOptions::default()
        })
        .with_progress(Box::new(move |done| sink.lock().unwrap().push(done)));

        for _ in 0..5 {
            writer.write(&[0u8; 600]).unwrap();
        }
        writer.finalize().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1200, 2400, 3000]);
    }
}
