//! Postmux-Media: container remuxing for downloaded media
//!
//! This crate turns DASH/WebM downloads into standalone, seekable files and
//! converts TTML subtitles to SRT. It only rewrites containers; sample data is
//! copied byte for byte.
//!
//! # Modules
//!
//! - `stream` - Seekable sources, output sinks and the in-place circular writer
//! - `track` - Track and sample model shared by every reader and writer
//! - `plan` - Interleave order and release watermarks for sample copying
//! - `mp4` - MP4 reader (monolithic and fragmented), moov-first and DASH writers
//! - `webm` - EBML primitives, WebM reader and writer
//! - `ogg` - Ogg pages and the Opus/Vorbis writer
//! - `subtitle` - TTML to SRT conversion
//!
//! # Architecture
//!
//! Every conversion follows the same shape:
//!
//! 1. A reader parses a [`stream::SeekableSource`] into [`track::Track`] models
//! 2. The caller selects the tracks to keep
//! 3. A writer computes the complete output layout up front
//! 4. Sample bytes are copied from the sources in interleave order
//!
//! While copying, writers release the source bytes they are done with. When
//! the output overwrites the very file the sources read from, the
//! [`stream::CircularFileWriter`] uses those release watermarks to decide how
//! far it may write.

pub mod error;
pub mod mp4;
pub mod ogg;
pub mod plan;
pub mod stream;
pub mod subtitle;
pub mod track;
pub mod webm;

pub use error::{Error, Result};
pub use mp4::{DashWriter, Mp4File, Mp4Writer};
pub use ogg::OggWriter;
pub use track::{Sample, Track, TrackKind};
pub use webm::{WebmFile, WebmWriter};
