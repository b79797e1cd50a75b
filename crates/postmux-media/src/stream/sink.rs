//! Plain file sink and progress reporting.

use super::OutputSink;
use crate::Result;
use std::fs::File;
use std::io::{BufWriter, Write};

/// Callback receiving the number of bytes produced so far.
pub type ProgressCallback = Box<dyn FnMut(u64) + Send>;

/// Throttles progress notifications to a fixed byte interval.
pub struct ProgressReporter {
    callback: ProgressCallback,
    interval: u64,
    next_report: u64,
}

impl ProgressReporter {
    pub fn new(interval: u64, callback: ProgressCallback) -> Self {
        let interval = interval.max(1);
        Self {
            callback,
            interval,
            next_report: interval,
        }
    }

    /// Notify if `done` crossed the next reporting boundary.
    pub fn update(&mut self, done: u64) {
        if done >= self.next_report {
            self.next_report = done + self.interval;
            (self.callback)(done);
        }
    }

    /// Notify unconditionally.
    pub fn finish(&mut self, done: u64) {
        (self.callback)(done);
    }
}

/// Buffered sink writing to a fresh file, used for separate-output runs.
pub struct FileSink {
    writer: BufWriter<File>,
    written: u64,
    progress: Option<ProgressReporter>,
}

impl FileSink {
    pub fn new(file: File) -> Self {
        Self {
            writer: BufWriter::new(file),
            written: 0,
            progress: None,
        }
    }

    /// Report progress every `interval` bytes.
    pub fn with_progress(mut self, interval: u64, callback: ProgressCallback) -> Self {
        self.progress = Some(ProgressReporter::new(interval, callback));
        self
    }

    /// Flush buffered data and return the file length.
    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        if let Some(progress) = self.progress.as_mut() {
            progress.finish(self.written);
        }
        Ok(self.written)
    }
}

impl OutputSink for FileSink {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf)?;
        self.written += buf.len() as u64;
        if let Some(progress) = self.progress.as_mut() {
            progress.update(self.written);
        }
        Ok(())
    }

    fn position(&self) -> u64 {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_reporter_interval() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut reporter = ProgressReporter::new(100, Box::new(move |done| sink.lock().unwrap().push(done)));

        for done in [10, 99, 100, 150, 199, 200, 250, 320] {
            reporter.update(done);
        }

        assert_eq!(*seen.lock().unwrap(), vec![100, 200, 320]);
    }

    #[test]
    fn test_file_sink_finish() {
        let file = tempfile::tempfile().unwrap();
        let mut sink = FileSink::new(file);
        sink.write_all(b"hello").unwrap();
        sink.write_all(b" world").unwrap();
        assert_eq!(sink.position(), 11);
        assert_eq!(sink.finish().unwrap(), 11);
    }
}
