//! Post-processing errors and the mission error codes they map to.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for post-processing runs.
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes reported on a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Nothing = 0,
    PathCreation = 1000,
    FileCreation = 1001,
    UnknownException = 1002,
    Postprocessing = 1007,
    PostprocessingStopped = 1008,
    PostprocessingHold = 1009,
    InsufficientStorage = 1010,
}

impl ErrorCode {
    pub fn value(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nothing => "NOTHING",
            Self::PathCreation => "PATH_CREATION",
            Self::FileCreation => "FILE_CREATION",
            Self::UnknownException => "UNKNOWN_EXCEPTION",
            Self::Postprocessing => "POSTPROCESSING",
            Self::PostprocessingStopped => "POSTPROCESSING_STOPPED",
            Self::PostprocessingHold => "POSTPROCESSING_HOLD",
            Self::InsufficientStorage => "INSUFFICIENT_STORAGE",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.value())
    }
}

/// Error type for post-processing runs.
#[derive(Debug, Error)]
pub enum Error {
    /// Algorithm name not present in the registry.
    #[error("Unimplemented post-processing algorithm: {0}")]
    UnimplementedAlgorithm(String),

    /// Mission description that cannot be run.
    #[error("Invalid mission: {0}")]
    InvalidMission(String),

    /// Parent directory of the output could not be created.
    #[error("Failed to create directory {path:?}: {source}")]
    PathCreation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Output or scratch file could not be created.
    #[error("Failed to create {path:?}: {source}")]
    FileCreation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failure inside a reader, writer or stream.
    #[error(transparent)]
    Media(#[from] postmux_media::Error),

    /// Anything else, with its cause.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn file_creation(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::FileCreation {
            path: path.into(),
            source,
        }
    }

    /// Mission error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnimplementedAlgorithm(_) | Self::InvalidMission(_) => ErrorCode::Postprocessing,
            Self::PathCreation { source, .. } | Self::FileCreation { source, .. }
                if source.kind() == io::ErrorKind::StorageFull =>
            {
                ErrorCode::InsufficientStorage
            }
            Self::PathCreation { .. } => ErrorCode::PathCreation,
            Self::FileCreation { .. } => ErrorCode::FileCreation,
            Self::Media(err) if err.is_write_hold() => ErrorCode::PostprocessingStopped,
            Self::Media(err) if err.is_storage_full() => ErrorCode::InsufficientStorage,
            Self::Media(_) => ErrorCode::Postprocessing,
            Self::Unknown(_) => ErrorCode::UnknownException,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Media(err.into())
    }
}
