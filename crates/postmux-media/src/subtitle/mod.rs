//! Subtitle conversion to SubRip.
//!
//! TTML documents are parsed into [`Cue`]s and written as SRT; input that is
//! already SRT is copied through untouched.

mod srt;
mod ttml;

pub use srt::{format_timestamp, write_srt};
pub use ttml::{parse_time, parse_ttml};

use crate::stream::{copy_range_releasing, OutputSink, SeekableSource, QUEUE_BUFFER_SIZE};
use crate::{Error, Result};
use std::str::FromStr;

/// Largest subtitle document loaded into memory.
const MAX_DOCUMENT_SIZE: u64 = 64 * 1024 * 1024;

/// One subtitle frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub start_ms: u64,
    pub end_ms: u64,
    /// Text with CRLF line breaks.
    pub text: String,
}

impl Cue {
    /// Whether the text holds nothing but spaces and line breaks.
    pub fn is_blank(&self) -> bool {
        self.text.chars().all(|c| matches!(c, ' ' | '\t' | '\r' | '\n'))
    }
}

/// Subtitle formats accepted by [`convert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleFormat {
    Ttml,
    Srt,
}

impl FromStr for SubtitleFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ttml" | "dfxp" | "xml" => Ok(Self::Ttml),
            "srt" => Ok(Self::Srt),
            other => Err(Error::unsupported_subtitle(format!("'{}'", other))),
        }
    }
}

/// TTML conversion switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Drop cues without visible text.
    pub ignore_empty_frames: bool,
    /// Keep italic, bold, underline and color as SRT tags.
    pub keep_formatting: bool,
    /// Prefix top-aligned cues with `{\an8}`.
    pub honor_positioning: bool,
    /// Cut overlapping rolling captions so each line ends where the next begins.
    pub detect_duplicate_lines: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            ignore_empty_frames: true,
            keep_formatting: false,
            honor_positioning: false,
            detect_duplicate_lines: false,
        }
    }
}

/// Convert `source` into SRT. Returns the number of bytes written.
pub fn convert<S, O>(format: SubtitleFormat, source: &mut S, sink: &mut O, options: &ConvertOptions) -> Result<u64>
where
    S: SeekableSource + ?Sized,
    O: OutputSink + ?Sized,
{
    let length = source.length();
    match format {
        SubtitleFormat::Srt => {
            let mut buffer = vec![0u8; QUEUE_BUFFER_SIZE];
            copy_range_releasing(source, 0, length, sink, &mut buffer, length)?;
            source.release(length);
            Ok(length)
        }
        SubtitleFormat::Ttml => {
            if length > MAX_DOCUMENT_SIZE {
                return Err(Error::unsupported_subtitle(format!(
                    "TTML document of {} bytes is too large",
                    length
                )));
            }
            source.rewind()?;
            let data = source.read_vec(length as usize)?;
            source.release(length);

            let text = std::str::from_utf8(&data)
                .map_err(|e| Error::malformed(format!("TTML is not UTF-8: {}", e)))?;
            let cues = parse_ttml(text.trim_start_matches('\u{FEFF}'), options)?;
            tracing::debug!("Parsed {} TTML cues", cues.len());
            write_srt(&cues, sink)
        }
    }
}
