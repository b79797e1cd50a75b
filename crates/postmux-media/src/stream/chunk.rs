//! File-backed windowed source and its progress handle.

use super::SeekableSource;
use crate::{Error, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct ProgressState {
    start: u64,
    end: u64,
    released: AtomicU64,
    disposed: AtomicBool,
}

/// Shared view of how far a [`ChunkFileSource`] has been consumed.
///
/// Cloned out of the source before processing starts so a safe-offset
/// checker can observe the source without borrowing it.
#[derive(Debug, Clone)]
pub struct SourceProgress {
    state: Arc<ProgressState>,
}

impl SourceProgress {
    fn new(start: u64, end: u64) -> Self {
        Self {
            state: Arc::new(ProgressState {
                start,
                end,
                released: AtomicU64::new(start),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Absolute file offset below which the source no longer needs data.
    ///
    /// Returns `None` once the source is disposed or fully released.
    pub fn watermark(&self) -> Option<u64> {
        if self.state.disposed.load(Ordering::Acquire) {
            return None;
        }
        let released = self.state.released.load(Ordering::Acquire);
        if released >= self.state.end {
            None
        } else {
            Some(released)
        }
    }

    /// Absolute window of the source in its file.
    pub fn window(&self) -> (u64, u64) {
        (self.state.start, self.state.end)
    }
}

/// Safe-offset computation over a set of sources sharing one file.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    sources: Vec<SourceProgress>,
}

impl ProgressTracker {
    /// Track the given sources.
    pub fn new(sources: Vec<SourceProgress>) -> Self {
        Self { sources }
    }

    /// Lowest watermark among live sources, `None` when no source needs data.
    pub fn safe_offset(&self) -> Option<u64> {
        self.sources.iter().filter_map(SourceProgress::watermark).min()
    }
}

/// Source restricted to the window `[start, end)` of a physical file.
pub struct ChunkFileSource {
    reader: Option<BufReader<File>>,
    start: u64,
    end: u64,
    position: u64,
    progress: SourceProgress,
}

impl ChunkFileSource {
    /// Open `path` and expose `[start, end)`. `None` extends to the end of file.
    pub fn open(path: &Path, start: u64, end: Option<u64>) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_file(file, start, end)
    }

    /// Wrap an already opened file.
    pub fn from_file(mut file: File, start: u64, end: Option<u64>) -> Result<Self> {
        let file_len = file.metadata()?.len();
        let end = end.unwrap_or(file_len).min(file_len);
        if start > end {
            return Err(Error::OutOfRange {
                position: start,
                length: file_len,
            });
        }
        file.seek(SeekFrom::Start(start))?;

        Ok(Self {
            reader: Some(BufReader::new(file)),
            start,
            end,
            position: 0,
            progress: SourceProgress::new(start, end),
        })
    }

    /// Handle observing this source's release watermark.
    pub fn progress(&self) -> SourceProgress {
        self.progress.clone()
    }

    /// Absolute offset of the current position.
    pub fn file_pointer(&self) -> u64 {
        self.start + self.position
    }
}

impl SeekableSource for ChunkFileSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.available();
        let reader = self.reader.as_mut().ok_or(Error::Disposed)?;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let wanted = buf.len().min(remaining as usize);
        let read = reader.read(&mut buf[..wanted])?;
        self.position += read as u64;
        Ok(read)
    }

    fn seek_to(&mut self, position: u64) -> Result<()> {
        let length = self.length();
        let reader = self.reader.as_mut().ok_or(Error::Disposed)?;
        if position > length {
            return Err(Error::OutOfRange { position, length });
        }
        let delta = position as i64 - self.position as i64;
        reader.seek_relative(delta)?;
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn length(&self) -> u64 {
        self.end - self.start
    }

    fn dispose(&mut self) {
        self.reader = None;
        self.progress.state.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.reader.is_none()
    }

    fn release(&mut self, upto: u64) {
        let absolute = self.start + upto.min(self.length());
        self.progress
            .state
            .released
            .fetch_max(absolute, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ChunkFileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkFileSource")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("position", &self.position)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn numbered_file(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_window_positions_are_relative() {
        let file = numbered_file(100);
        let mut source = ChunkFileSource::open(file.path(), 20, Some(30)).unwrap();

        assert_eq!(source.length(), 10);
        let mut buf = [0u8; 64];
        assert_eq!(source.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..3], &[20, 21, 22]);
        assert_eq!(source.read(&mut buf).unwrap(), 0);
        assert_eq!(source.file_pointer(), 30);
    }

    #[test]
    fn test_seek_and_rewind() {
        let file = numbered_file(100);
        let mut source = ChunkFileSource::open(file.path(), 50, None).unwrap();

        source.seek_to(10).unwrap();
        let mut byte = [0u8; 1];
        source.read_fully(&mut byte).unwrap();
        assert_eq!(byte[0], 60);

        source.rewind().unwrap();
        source.read_fully(&mut byte).unwrap();
        assert_eq!(byte[0], 50);

        assert!(matches!(
            source.seek_to(51),
            Err(Error::OutOfRange { position: 51, length: 50 })
        ));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let file = numbered_file(10);
        let mut source = ChunkFileSource::open(file.path(), 0, None).unwrap();
        source.dispose();
        source.dispose();
        let mut buf = [0u8; 1];
        assert!(matches!(source.read(&mut buf), Err(Error::Disposed)));
    }

    #[test]
    fn test_tracker_uses_lowest_live_watermark() {
        let file = numbered_file(100);
        let mut first = ChunkFileSource::open(file.path(), 0, Some(40)).unwrap();
        let mut second = ChunkFileSource::open(file.path(), 40, None).unwrap();
        let tracker = ProgressTracker::new(vec![first.progress(), second.progress()]);

        assert_eq!(tracker.safe_offset(), Some(0));

        first.release(25);
        second.release(10);
        assert_eq!(tracker.safe_offset(), Some(25));

        first.release(40);
        assert_eq!(tracker.safe_offset(), Some(50));

        second.dispose();
        assert_eq!(tracker.safe_offset(), None);
    }
}
