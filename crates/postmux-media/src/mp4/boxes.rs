//! Box serialization helpers shared by the MP4 writers.

use super::atoms::pack_language;
use super::HandlerType;
use crate::track::{Track, TrackKind};
use bytes::{BufMut, BytesMut};

/// Open a box, returning its start for [`end_box`].
pub(crate) fn begin_box(buf: &mut BytesMut, fourcc: &[u8; 4]) -> usize {
    let start = buf.len();
    buf.put_u32(0); // placeholder size
    buf.put_slice(fourcc);
    start
}

/// Open a full box with version and flags.
pub(crate) fn begin_full_box(buf: &mut BytesMut, fourcc: &[u8; 4], version: u8, flags: u32) -> usize {
    let start = begin_box(buf, fourcc);
    buf.put_u32((version as u32) << 24 | (flags & 0x00FF_FFFF));
    start
}

/// Backpatch the size of a box opened at `start`.
pub(crate) fn end_box(buf: &mut BytesMut, start: usize) {
    let size = buf.len() - start;
    let size_bytes = (size as u32).to_be_bytes();
    buf[start..start + 4].copy_from_slice(&size_bytes);
}

pub(crate) fn write_ftyp(buf: &mut BytesMut, major: &[u8; 4], minor: u32, brands: &[&[u8; 4]]) {
    let start = begin_box(buf, b"ftyp");
    buf.put_slice(major);
    buf.put_u32(minor);
    for brand in brands {
        buf.put_slice(*brand);
    }
    end_box(buf, start);
}

fn put_matrix(buf: &mut BytesMut) {
    // Matrix (identity)
    buf.put_u32(0x00010000);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0x00010000);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_u32(0x40000000);
}

pub(crate) fn write_mvhd(buf: &mut BytesMut, timescale: u32, duration: u64, next_track_id: u32) {
    let start = begin_full_box(buf, b"mvhd", 1, 0);
    buf.put_u64(0); // creation time
    buf.put_u64(0); // modification time
    buf.put_u32(timescale);
    buf.put_u64(duration);
    buf.put_u32(0x00010000); // rate = 1.0
    buf.put_u16(0x0100); // volume = 1.0
    buf.put_u16(0); // reserved
    buf.put_u64(0); // reserved
    put_matrix(buf);
    // Pre-defined (6 * 4 bytes)
    for _ in 0..6 {
        buf.put_u32(0);
    }
    buf.put_u32(next_track_id);
    end_box(buf, start);
}

/// tkhd v1, enabled and in movie.
pub(crate) fn write_tkhd(buf: &mut BytesMut, track: &Track, track_id: u32, duration: u64) {
    let start = begin_full_box(buf, b"tkhd", 1, 3);
    buf.put_u64(0); // creation time
    buf.put_u64(0); // modification time
    buf.put_u32(track_id);
    buf.put_u32(0); // reserved
    buf.put_u64(duration);
    buf.put_u64(0); // reserved
    buf.put_u16(0); // layer
    buf.put_u16(0); // alternate group
    buf.put_u16(if track.kind.is_audio() { 0x0100 } else { 0 }); // volume
    buf.put_u16(0); // reserved
    put_matrix(buf);
    // Width and height (16.16 fixed point)
    let (width, height) = track.video.map_or((0, 0), |v| (v.width, v.height));
    buf.put_u32(width << 16);
    buf.put_u32(height << 16);
    end_box(buf, start);
}

/// edts with a single elst entry mapping the whole track.
pub(crate) fn write_edts(buf: &mut BytesMut, segment_duration: u64, media_time: i64) {
    let start = begin_box(buf, b"edts");
    let elst = begin_full_box(buf, b"elst", 1, 0);
    buf.put_u32(1); // entry count
    buf.put_u64(segment_duration);
    buf.put_i64(media_time);
    buf.put_u32(0x00010000); // media rate 1.0
    end_box(buf, elst);
    end_box(buf, start);
}

pub(crate) fn write_mdhd(buf: &mut BytesMut, timescale: u32, duration: u64, language: Option<&str>) {
    let start = begin_full_box(buf, b"mdhd", 1, 0);
    buf.put_u64(0); // creation time
    buf.put_u64(0); // modification time
    buf.put_u32(timescale);
    buf.put_u64(duration);
    buf.put_u16(pack_language(language.unwrap_or("und")));
    buf.put_u16(0); // pre_defined
    end_box(buf, start);
}

pub(crate) fn write_hdlr(buf: &mut BytesMut, kind: TrackKind) {
    let (handler, name) = match kind {
        TrackKind::Video => (HandlerType::Video, "VideoHandler"),
        TrackKind::Audio => (HandlerType::Audio, "SoundHandler"),
        TrackKind::Subtitle => (HandlerType::Subtitle, "SubtitleHandler"),
        TrackKind::Other => (HandlerType::Meta, "MetaHandler"),
    };
    let start = begin_full_box(buf, b"hdlr", 0, 0);
    buf.put_u32(0); // pre_defined
    buf.put_slice(&handler.as_bytes());
    buf.put_u32(0); // reserved
    buf.put_u32(0);
    buf.put_u32(0);
    buf.put_slice(name.as_bytes());
    buf.put_u8(0); // null terminator
    end_box(buf, start);
}

/// vmhd, smhd or nmhd depending on the track kind.
pub(crate) fn write_media_header(buf: &mut BytesMut, kind: TrackKind) {
    match kind {
        TrackKind::Video => {
            let start = begin_full_box(buf, b"vmhd", 0, 1);
            buf.put_u16(0); // graphics mode
            buf.put_u16(0);
            buf.put_u16(0);
            buf.put_u16(0); // opcolor
            end_box(buf, start);
        }
        TrackKind::Audio => {
            let start = begin_full_box(buf, b"smhd", 0, 0);
            buf.put_u16(0); // balance
            buf.put_u16(0); // reserved
            end_box(buf, start);
        }
        _ => {
            let start = begin_full_box(buf, b"nmhd", 0, 0);
            end_box(buf, start);
        }
    }
}

pub(crate) fn write_dinf(buf: &mut BytesMut) {
    buf.put_u32(36);
    buf.put_slice(b"dinf");

    // dref
    buf.put_u32(28);
    buf.put_slice(b"dref");
    buf.put_u32(0); // version/flags
    buf.put_u32(1); // entry count

    // url (self-reference)
    buf.put_u32(12);
    buf.put_slice(b"url ");
    buf.put_u32(1); // flags: self-contained
}

/// Whether the track's codec config is a single complete sample entry box.
pub(crate) fn has_sample_entry(track: &Track) -> bool {
    let entry = &track.codec_config;
    entry.len() >= 8
        && u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]) as usize == entry.len()
}

/// stsd holding the track's sample entry box verbatim.
pub(crate) fn write_stsd(buf: &mut BytesMut, track: &Track) {
    let start = begin_full_box(buf, b"stsd", 0, 0);
    buf.put_u32(1); // entry count
    buf.put_slice(&track.codec_config);
    end_box(buf, start);
}

/// Size of an mdat header for `payload` bytes.
pub(crate) fn mdat_header_size(payload: u64) -> u64 {
    if payload + 8 > u32::MAX as u64 {
        16
    } else {
        8
    }
}

pub(crate) fn write_mdat_header(buf: &mut BytesMut, payload: u64) {
    if mdat_header_size(payload) == 16 {
        // Extended size
        buf.put_u32(1);
        buf.put_slice(b"mdat");
        buf.put_u64(payload + 16);
    } else {
        buf.put_u32((payload + 8) as u32);
        buf.put_slice(b"mdat");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_backpatch() {
        let mut buf = BytesMut::new();
        let outer = begin_box(&mut buf, b"moov");
        let inner = begin_full_box(&mut buf, b"mfhd", 0, 0);
        buf.put_u32(7);
        end_box(&mut buf, inner);
        end_box(&mut buf, outer);

        assert_eq!(&buf[0..4], &24u32.to_be_bytes());
        assert_eq!(&buf[8..12], &16u32.to_be_bytes());
        assert_eq!(&buf[12..16], b"mfhd");
    }

    #[test]
    fn test_mdat_header_switches_to_largesize() {
        let mut small = BytesMut::new();
        write_mdat_header(&mut small, 100);
        assert_eq!(small.len(), 8);
        assert_eq!(&small[0..4], &108u32.to_be_bytes());

        let mut large = BytesMut::new();
        write_mdat_header(&mut large, 5_000_000_000);
        assert_eq!(large.len(), 16);
        assert_eq!(&large[0..4], &1u32.to_be_bytes());
        assert_eq!(&large[8..16], &5_000_000_016u64.to_be_bytes());
    }

    #[test]
    fn test_sample_entry_check() {
        let mut track = Track::new(0, 1, TrackKind::Audio, "mp4a");
        track.codec_config = crate::mp4::tests::audio_entry();
        assert!(has_sample_entry(&track));

        // an OpusHead is not a box
        track.codec_config = b"OpusHead\x01\x02\x38\x01\x80\xbb\x00\x00\x00\x00\x00".to_vec();
        assert!(!has_sample_entry(&track));
    }

    #[test]
    fn test_fixed_size_boxes() {
        let mut buf = BytesMut::new();
        write_mvhd(&mut buf, 1000, 5000, 2);
        assert_eq!(buf.len(), 120);

        let mut buf = BytesMut::new();
        write_mdhd(&mut buf, 48000, 0, Some("eng"));
        assert_eq!(buf.len(), 44);
    }
}
