//! WebM/Matroska container support.
//!
//! [`WebmReader`] indexes a file into [`Track`] models without loading frame
//! data; [`WebmWriter`] writes a selection of tracks back out as WebM.

pub mod ebml;
mod reader;
mod writer;

pub use reader::{WebmReader, DEFAULT_TIMECODE_SCALE};
pub use writer::{WebmWriter, APP_NAME};

use crate::stream::{ChunkFileSource, SeekableSource};
use crate::track::{Track, TrackKind};
use crate::Result;
use std::path::Path;

/// EBML magic, the first four bytes of every WebM file.
pub const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Parsed WebM file.
#[derive(Debug, Clone)]
pub struct WebmFile {
    /// `webm` or `matroska`.
    pub doc_type: String,
    /// Nanoseconds per segment tick.
    pub timecode_scale: u64,
    /// Segment duration in ticks.
    pub duration: Option<f64>,
    pub muxing_app: Option<String>,
    pub writing_app: Option<String>,
    pub tracks: Vec<Track>,
    pub cluster_count: usize,
    pub has_cues: bool,
}

impl WebmFile {
    /// Parse a WebM file from the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut source = ChunkFileSource::open(path.as_ref(), 0, None)?;
        Self::parse(&mut source, 0)
    }

    /// Parse from a source; tracks are tagged with `source_index`.
    pub fn parse<S: SeekableSource + ?Sized>(source: &mut S, source_index: usize) -> Result<Self> {
        WebmReader::new(source, source_index).parse()
    }

    /// Duration in seconds, from Info or else from the longest track.
    pub fn duration_secs(&self) -> f64 {
        match self.duration {
            Some(ticks) => ticks * self.timecode_scale as f64 / 1e9,
            None => self
                .tracks
                .iter()
                .map(Track::duration_secs)
                .fold(0.0, f64::max),
        }
    }

    /// First track of the given kind.
    pub fn track(&self, kind: TrackKind) -> Option<&Track> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Index of the first track of the given kind.
    pub fn track_index(&self, kind: TrackKind) -> Option<usize> {
        crate::track::find_track(&self.tracks, kind)
    }
}
