//! Error types for postmux-media.

use std::io;
use thiserror::Error;

/// Result type for postmux-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for postmux-media operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Seek target outside of the logical range of a source.
    #[error("Position {position} is out of range (length: {length})")]
    OutOfRange { position: u64, length: u64 },

    /// Source or writer used after `dispose()`.
    #[error("Stream already disposed")]
    Disposed,

    /// Unparseable or truncated container.
    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    /// Recognized input that cannot be handled.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Subtitle format that the converter does not handle.
    #[error("Unsupported subtitle format: {0}")]
    UnsupportedSubtitleFormat(String),

    /// The circular writer could not advance and the hold was not resumed.
    #[error("Write hold: {0}")]
    WriteHold(String),

    /// The safe offset reported by the checker moved behind data already written.
    #[error("Safe offset {offset} is behind the committed length {committed}")]
    InvalidSafeOffset { offset: u64, committed: u64 },

    /// Buffer too small for operation.
    #[error("Buffer underflow: need {need} bytes, have {have}")]
    BufferUnderflow { need: usize, have: usize },
}

impl Error {
    /// Create a malformed container error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedContainer(msg.into())
    }

    /// Create an unsupported format error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedFormat(msg.into())
    }

    /// Create an unsupported subtitle format error.
    pub fn unsupported_subtitle(msg: impl Into<String>) -> Self {
        Self::UnsupportedSubtitleFormat(msg.into())
    }

    /// Whether this error ends a same-file run with the hold unresolved.
    pub fn is_write_hold(&self) -> bool {
        matches!(self, Self::WriteHold(_))
    }

    /// Whether the underlying cause is a full disk.
    pub fn is_storage_full(&self) -> bool {
        match self {
            Self::Io(err) => err.kind() == io::ErrorKind::StorageFull,
            _ => false,
        }
    }
}
