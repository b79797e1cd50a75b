//! Fragmented (DASH) MP4 writer.
//!
//! Produces the layout DASH servers hand out: an init part (`ftyp` + `moov`
//! with empty sample tables and `mvex`) followed by one `moof`+`mdat` pair
//! per track fragment.

use super::boxes::{
    begin_box, begin_full_box, end_box, has_sample_entry, mdat_header_size, write_dinf, write_ftyp, write_hdlr,
    write_mdat_header, write_mdhd, write_media_header, write_mvhd, write_stsd, write_tkhd,
};
use crate::plan::{CopyPlan, Span};
use crate::stream::{copy_range_releasing, OutputSink, SeekableSource, QUEUE_BUFFER_SIZE};
use crate::track::{Sample, Track};
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};

/// Builder for one `moof` box plus the following mdat header.
pub struct MoofBuilder {
    sequence_number: u32,
    track_id: u32,
    base_media_decode_time: u64,
}

impl MoofBuilder {
    /// Create a new moof builder.
    pub fn new(sequence_number: u32, track_id: u32) -> Self {
        Self {
            sequence_number,
            track_id,
            base_media_decode_time: 0,
        }
    }

    /// Set base media decode time.
    pub fn base_media_decode_time(mut self, time: u64) -> Self {
        self.base_media_decode_time = time;
        self
    }

    /// Build moof + mdat header for the given samples.
    ///
    /// The sample data is expected right after the returned bytes.
    pub fn build(self, samples: &[Sample]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(256 + samples.len() * 16);
        let payload: u64 = samples.iter().map(|s| s.size as u64).sum();

        let moof_start = begin_box(&mut buf, b"moof");

        // mfhd
        let mfhd = begin_full_box(&mut buf, b"mfhd", 0, 0);
        buf.put_u32(self.sequence_number);
        end_box(&mut buf, mfhd);

        let traf_start = begin_box(&mut buf, b"traf");

        // tfhd: default-base-is-moof
        let tfhd = begin_full_box(&mut buf, b"tfhd", 0, 0x020000);
        buf.put_u32(self.track_id);
        end_box(&mut buf, tfhd);

        // tfdt v1 for 64-bit decode time
        let tfdt = begin_full_box(&mut buf, b"tfdt", 1, 0);
        buf.put_u64(self.base_media_decode_time);
        end_box(&mut buf, tfdt);

        // data offset, duration, size, flags and composition offset per sample
        let trun = begin_full_box(&mut buf, b"trun", 1, 0x000001 | 0x000100 | 0x000200 | 0x000400 | 0x000800);
        buf.put_u32(samples.len() as u32);
        let data_offset_pos = buf.len();
        buf.put_u32(0); // placeholder
        for sample in samples {
            buf.put_u32(sample.duration);
            buf.put_u32(sample.size);
            // sync sample = 0x02000000, non-sync = 0x01010000
            buf.put_u32(if sample.keyframe { 0x02000000 } else { 0x01010000 });
            buf.put_i32(sample.composition_offset);
        }
        end_box(&mut buf, trun);

        end_box(&mut buf, traf_start);
        end_box(&mut buf, moof_start);

        // Data offset is relative to the moof start, which is 0 here
        let data_offset = (buf.len() as u64 + mdat_header_size(payload)) as i32;
        buf[data_offset_pos..data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());

        write_mdat_header(&mut buf, payload);
        buf.to_vec()
    }
}

/// Writes tracks as a fragmented MP4.
pub struct DashWriter {
    tracks: Vec<Track>,
    fragment_ms: u32,
}

impl DashWriter {
    pub fn new(tracks: Vec<Track>) -> Result<Self> {
        if tracks.is_empty() {
            return Err(Error::unsupported("no tracks selected"));
        }
        if let Some(track) = tracks.iter().find(|t| !has_sample_entry(t) || t.timescale == 0) {
            return Err(Error::unsupported(format!(
                "track {} ({}) cannot be stored in MP4",
                track.id, track.codec_id
            )));
        }
        Ok(Self {
            tracks,
            fragment_ms: 1000,
        })
    }

    /// Target decode time per fragment.
    pub fn with_fragment_duration(mut self, fragment_ms: u32) -> Self {
        self.fragment_ms = fragment_ms.max(1);
        self
    }

    /// Write the init part and every fragment. Returns the number of bytes written.
    pub fn write<S, O>(&self, sources: &mut [S], sink: &mut O) -> Result<u64>
    where
        S: SeekableSource,
        O: OutputSink + ?Sized,
    {
        let track_refs: Vec<&Track> = self.tracks.iter().collect();
        let plan = CopyPlan::new(&track_refs, self.fragment_spans(), sources.len());

        let mut init = BytesMut::with_capacity(2048);
        write_ftyp(&mut init, b"dash", 0, &[b"iso6", b"mp41"]);
        self.write_moov(&mut init);

        plan.begin(sources);
        let start = sink.position();
        sink.write_all(&init)?;

        let mut buffer = vec![0u8; QUEUE_BUFFER_SIZE];
        for (index, span) in plan.spans().iter().enumerate() {
            let track = &self.tracks[span.track];
            let samples = &track.samples[span.first..span.first + span.count];
            let moof = MoofBuilder::new(index as u32 + 1, span.track as u32 + 1)
                .base_media_decode_time(samples[0].timestamp)
                .build(samples);
            sink.write_all(&moof)?;

            let source = sources.get_mut(track.source).ok_or_else(|| {
                Error::unsupported(format!("track {} refers to missing source {}", track.id, track.source))
            })?;
            for (k, sample) in samples.iter().enumerate() {
                let floor = plan.floor(index, k);
                copy_range_releasing(source, sample.offset, sample.size as u64, sink, &mut buffer, floor)?;
            }
            plan.finish_span(index, sources);
        }

        tracing::debug!("Wrote {} DASH fragments", plan.spans().len());
        Ok(sink.position() - start)
    }

    fn fragment_spans(&self) -> Vec<Span> {
        let mut spans = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            let window = (self.fragment_ms as u64 * track.timescale as u64 / 1000).max(1);
            let mut first = 0;
            for i in 1..=track.samples.len() {
                let boundary = i == track.samples.len()
                    || track.samples[i].timestamp >= track.samples[first].timestamp + window;
                if boundary {
                    spans.push(Span {
                        track: t,
                        first,
                        count: i - first,
                        time_ns: track.ticks_to_ns(track.samples[first].timestamp),
                    });
                    first = i;
                }
            }
        }
        spans
    }

    fn write_moov(&self, buf: &mut BytesMut) {
        let moov_start = begin_box(buf, b"moov");
        let longest = self
            .tracks
            .iter()
            .map(|t| t.effective_duration() * 1000 / t.timescale as u64)
            .max()
            .unwrap_or(0);
        write_mvhd(buf, 1000, longest, self.tracks.len() as u32 + 1);

        for (i, track) in self.tracks.iter().enumerate() {
            let trak_start = begin_box(buf, b"trak");
            write_tkhd(buf, track, i as u32 + 1, 0);

            let mdia_start = begin_box(buf, b"mdia");
            write_mdhd(buf, track.timescale, 0, track.language.as_deref());
            write_hdlr(buf, track.kind);

            let minf_start = begin_box(buf, b"minf");
            write_media_header(buf, track.kind);
            write_dinf(buf);

            // Empty sample tables (required for fMP4)
            let stbl_start = begin_box(buf, b"stbl");
            write_stsd(buf, track);
            for fourcc in [b"stts", b"stsc", b"stco"] {
                let table = begin_full_box(buf, fourcc, 0, 0);
                buf.put_u32(0); // entry count
                end_box(buf, table);
            }
            let stsz = begin_full_box(buf, b"stsz", 0, 0);
            buf.put_u32(0); // sample size
            buf.put_u32(0); // sample count
            end_box(buf, stsz);
            end_box(buf, stbl_start);

            end_box(buf, minf_start);
            end_box(buf, mdia_start);
            end_box(buf, trak_start);
        }

        // mvex (movie extends for fragmented)
        let mvex_start = begin_box(buf, b"mvex");
        for i in 0..self.tracks.len() {
            let trex = begin_full_box(buf, b"trex", 0, 0);
            buf.put_u32(i as u32 + 1);
            buf.put_u32(1); // default sample description index
            buf.put_u32(0); // default sample duration
            buf.put_u32(0); // default sample size
            buf.put_u32(0); // default sample flags
            end_box(buf, trex);
        }
        end_box(buf, mvex_start);

        end_box(buf, moov_start);
    }
}
