//! MP4 container support.
//!
//! - [`Mp4Reader`] indexes monolithic and fragmented (DASH) files into
//!   [`Track`] models.
//! - [`Mp4Writer`] merges tracks into a moov-first, non-fragmented file.
//! - [`DashWriter`] writes tracks as a fragmented file.

mod atoms;
mod boxes;
mod fragmented;
mod reader;
mod sample_table;
mod writer;

pub use atoms::{pack_language, unpack_language, Atom, AtomType, HandlerType};
pub use fragmented::{DashWriter, MoofBuilder};
pub use reader::Mp4Reader;
pub use sample_table::SampleTableBuilder;
pub use writer::{Mp4Brand, Mp4Writer, Mp4WriterOptions};

use crate::stream::{ChunkFileSource, SeekableSource};
use crate::track::{Track, TrackKind};
use crate::Result;
use std::path::Path;

/// Parsed MP4 file.
#[derive(Debug, Clone)]
pub struct Mp4File {
    pub major_brand: [u8; 4],
    pub minor_version: u32,
    pub compatible_brands: Vec<[u8; 4]>,
    /// Movie timescale (time units per second).
    pub timescale: u32,
    /// Duration in movie timescale units.
    pub duration: u64,
    pub tracks: Vec<Track>,
    /// Number of `moof` boxes seen.
    pub fragment_count: usize,
    /// Whether moov comes before mdat.
    pub has_faststart: bool,
}

impl Mp4File {
    /// Parse an MP4 file from the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut source = ChunkFileSource::open(path.as_ref(), 0, None)?;
        Self::parse(&mut source, 0)
    }

    /// Parse from a source; tracks are tagged with `source_index`.
    pub fn parse<S: SeekableSource + ?Sized>(source: &mut S, source_index: usize) -> Result<Self> {
        Mp4Reader::new(source, source_index).parse()
    }

    /// Major brand as text.
    pub fn brand_str(&self) -> String {
        String::from_utf8_lossy(&self.major_brand).into_owned()
    }

    pub fn is_fragmented(&self) -> bool {
        self.fragment_count > 0
    }

    /// Whether the major brand marks a DASH download.
    pub fn is_dash(&self) -> bool {
        matches!(&self.major_brand, b"dash" | b"iso5")
    }

    /// Get the duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.timescale == 0 {
            0.0
        } else {
            self.duration as f64 / self.timescale as f64
        }
    }

    /// Index of the track with the given container id.
    pub fn track_index(&self, id: u64) -> Option<usize> {
        self.tracks.iter().position(|t| t.id == id)
    }

    /// First track of the given kind.
    pub fn track(&self, kind: TrackKind) -> Option<&Track> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::boxes::{begin_box, end_box};
    use bytes::{BufMut, BytesMut};

    /// `mp4a` sample entry: stereo, 16 bit, 44.1 kHz, with a short esds.
    pub(crate) fn audio_entry() -> Vec<u8> {
        let mut buf = BytesMut::new();
        let start = begin_box(&mut buf, b"mp4a");
        buf.put_slice(&[0; 6]); // reserved
        buf.put_u16(1); // data reference index
        buf.put_u64(0); // reserved
        buf.put_u16(2); // channels
        buf.put_u16(16); // sample size
        buf.put_u32(0); // pre_defined + reserved
        buf.put_u32(44100 << 16);
        let esds = begin_box(&mut buf, b"esds");
        buf.put_u32(0); // version/flags
        buf.put_slice(&[0x03, 0x05, 0x00, 0x01, 0x00, 0x12, 0x10]);
        end_box(&mut buf, esds);
        end_box(&mut buf, start);
        buf.to_vec()
    }

    /// `avc1` sample entry for 640x360 with a stub avcC.
    pub(crate) fn video_entry() -> Vec<u8> {
        let mut buf = BytesMut::new();
        let start = begin_box(&mut buf, b"avc1");
        buf.put_slice(&[0; 6]); // reserved
        buf.put_u16(1); // data reference index
        buf.put_slice(&[0; 16]); // pre_defined + reserved
        buf.put_u16(640);
        buf.put_u16(360);
        buf.put_u32(0x00480000); // horiz resolution 72 dpi
        buf.put_u32(0x00480000); // vert resolution 72 dpi
        buf.put_u32(0); // reserved
        buf.put_u16(1); // frame count
        buf.put_slice(&[0; 32]); // compressor name
        buf.put_u16(0x0018); // depth
        buf.put_i16(-1); // pre_defined
        let avcc = begin_box(&mut buf, b"avcC");
        buf.put_slice(&[0x01, 0x64, 0x00, 0x1E, 0xFF, 0xE0, 0x00]);
        end_box(&mut buf, avcc);
        end_box(&mut buf, start);
        buf.to_vec()
    }

    #[test]
    fn test_fixture_entries_parse_as_sample_entries() {
        let audio = audio_entry();
        assert_eq!(&audio[4..8], b"mp4a");
        assert_eq!(u32::from_be_bytes([audio[0], audio[1], audio[2], audio[3]]) as usize, audio.len());

        let video = video_entry();
        assert_eq!(&video[4..8], b"avc1");
        assert_eq!(u16::from_be_bytes([video[32], video[33]]), 640);
    }
}
