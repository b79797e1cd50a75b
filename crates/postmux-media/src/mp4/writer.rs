//! Moov-first MP4 writer.
//!
//! Merges already indexed tracks (usually the video and audio halves of a
//! DASH download) into a single non-fragmented file laid out as
//! `ftyp`, `moov`, `mdat`. All tables are computed from the [`Track`] models
//! before the first byte is written, so output is strictly sequential and can
//! go through the circular writer.

use super::boxes::{
    begin_box, begin_full_box, end_box, has_sample_entry, mdat_header_size, write_dinf,
    write_edts, write_ftyp, write_hdlr, write_mdat_header, write_mdhd, write_media_header,
    write_mvhd, write_stsd, write_tkhd,
};
use crate::plan::{CopyPlan, Span};
use crate::stream::{copy_range_releasing, OutputSink, SeekableSource, QUEUE_BUFFER_SIZE};
use crate::track::{Sample, Track};
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};

/// Chunk offsets above this force co64.
const THRESHOLD_FOR_CO64: u64 = 0xFFFE_FFFF;

/// Movie timescale (milliseconds).
const MOVIE_TIMESCALE: u32 = 1000;

/// ftyp flavour of the output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mp4Brand {
    /// `mp42`, minor 512, compatible `mp41 isom iso2`.
    #[default]
    Mp4,
    /// `M4A `, minor 0, compatible `M4A  mp42 isom`.
    M4a,
}

/// Writer options.
#[derive(Debug, Clone)]
pub struct Mp4WriterOptions {
    pub brand: Mp4Brand,
    /// Decode time covered by one chunk.
    pub chunk_ms: u32,
}

impl Default for Mp4WriterOptions {
    fn default() -> Self {
        Self {
            brand: Mp4Brand::Mp4,
            chunk_ms: 1000,
        }
    }
}

/// Chunk layout of one output track.
#[derive(Debug, Default)]
struct TrackLayout {
    /// Offsets relative to the start of the mdat payload.
    chunk_offsets: Vec<u64>,
    samples_per_chunk: Vec<u32>,
}

/// Moov-first MP4 writer.
pub struct Mp4Writer {
    tracks: Vec<Track>,
    options: Mp4WriterOptions,
}

impl Mp4Writer {
    /// Create a writer for the given tracks, in output order.
    pub fn new(tracks: Vec<Track>, options: Mp4WriterOptions) -> Result<Self> {
        if tracks.is_empty() {
            return Err(Error::unsupported("no tracks selected"));
        }
        for track in &tracks {
            if !has_sample_entry(track) {
                return Err(Error::unsupported(format!(
                    "track {} ({}) carries no MP4 sample entry",
                    track.id, track.codec_id
                )));
            }
            if track.timescale == 0 {
                return Err(Error::malformed(format!("track {} has a zero timescale", track.id)));
            }
        }
        Ok(Self { tracks, options })
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Write the complete file. Returns the number of bytes written.
    pub fn write<S, O>(&self, sources: &mut [S], sink: &mut O) -> Result<u64>
    where
        S: SeekableSource,
        O: OutputSink + ?Sized,
    {
        let track_refs: Vec<&Track> = self.tracks.iter().collect();
        let plan = CopyPlan::new(&track_refs, self.chunk_spans(), sources.len());
        let (layouts, payload) = self.layout(&plan);

        let mut head = BytesMut::with_capacity(4096);
        self.write_ftyp(&mut head);
        let mdat_header = mdat_header_size(payload);

        // The moov size only depends on the offset width, not on the values.
        let sized = self.build_moov(&layouts, 0, false).len() as u64;
        let max_relative = layouts
            .iter()
            .filter_map(|l| l.chunk_offsets.last())
            .max()
            .copied()
            .unwrap_or(0);
        let use_co64 = head.len() as u64 + sized + mdat_header + max_relative > THRESHOLD_FOR_CO64;
        let moov_size = self.build_moov(&layouts, 0, use_co64).len() as u64;
        let base = head.len() as u64 + moov_size + mdat_header;

        let moov = self.build_moov(&layouts, base, use_co64);
        head.extend_from_slice(&moov);
        write_mdat_header(&mut head, payload);

        tracing::debug!(
            "Writing MP4: {} tracks, moov {} bytes, mdat payload {} bytes{}",
            self.tracks.len(),
            moov.len(),
            payload,
            if use_co64 { " (co64)" } else { "" }
        );

        plan.begin(sources);
        sink.write_all(&head)?;

        let mut buffer = vec![0u8; QUEUE_BUFFER_SIZE];
        for (index, span) in plan.spans().iter().enumerate() {
            let track = &self.tracks[span.track];
            let source = sources.get_mut(track.source).ok_or_else(|| {
                Error::unsupported(format!("track {} refers to missing source {}", track.id, track.source))
            })?;
            let samples = &track.samples[span.first..span.first + span.count];
            copy_samples(source, samples, sink, &mut buffer, |k| plan.floor(index, k))?;
            plan.finish_span(index, sources);
        }

        Ok(base + payload)
    }

    /// Cut every track into `chunk_ms` windows of decode time.
    fn chunk_spans(&self) -> Vec<Span> {
        let mut spans = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            let window = (self.options.chunk_ms.max(1) as u64 * track.timescale as u64 / 1000).max(1);
            let mut first = 0;
            for (i, sample) in track.samples.iter().enumerate() {
                let start = track.samples[first].timestamp;
                if i > first && sample.timestamp >= start + window {
                    spans.push(Span {
                        track: t,
                        first,
                        count: i - first,
                        time_ns: track.ticks_to_ns(start),
                    });
                    first = i;
                }
            }
            if first < track.samples.len() {
                spans.push(Span {
                    track: t,
                    first,
                    count: track.samples.len() - first,
                    time_ns: track.ticks_to_ns(track.samples[first].timestamp),
                });
            }
        }
        spans
    }

    /// Relative chunk offsets per track, plus the total payload size.
    fn layout(&self, plan: &CopyPlan) -> (Vec<TrackLayout>, u64) {
        let mut layouts: Vec<TrackLayout> = self.tracks.iter().map(|_| TrackLayout::default()).collect();
        let mut offset = 0u64;
        for span in plan.spans() {
            let layout = &mut layouts[span.track];
            layout.chunk_offsets.push(offset);
            layout.samples_per_chunk.push(span.count as u32);
            offset += self.tracks[span.track].samples[span.first..span.first + span.count]
                .iter()
                .map(|s| s.size as u64)
                .sum::<u64>();
        }
        (layouts, offset)
    }

    fn write_ftyp(&self, buf: &mut BytesMut) {
        match self.options.brand {
            Mp4Brand::Mp4 => write_ftyp(buf, b"mp42", 0x200, &[b"mp41", b"isom", b"iso2"]),
            Mp4Brand::M4a => write_ftyp(buf, b"M4A ", 0, &[b"M4A ", b"mp42", b"isom"]),
        }
    }

    fn build_moov(&self, layouts: &[TrackLayout], base: u64, use_co64: bool) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4096);
        let moov_start = begin_box(&mut buf, b"moov");

        let longest = self
            .tracks
            .iter()
            .map(movie_duration)
            .max()
            .unwrap_or(0);
        write_mvhd(&mut buf, MOVIE_TIMESCALE, longest, self.tracks.len() as u32 + 1);

        for (i, (track, layout)) in self.tracks.iter().zip(layouts).enumerate() {
            self.write_trak(&mut buf, track, i as u32 + 1, layout, base, use_co64);
        }

        end_box(&mut buf, moov_start);
        buf
    }

    fn write_trak(
        &self,
        buf: &mut BytesMut,
        track: &Track,
        track_id: u32,
        layout: &TrackLayout,
        base: u64,
        use_co64: bool,
    ) {
        let trak_start = begin_box(buf, b"trak");
        let duration = movie_duration(track);

        write_tkhd(buf, track, track_id, duration);
        write_edts(buf, duration, track.media_time);

        let mdia_start = begin_box(buf, b"mdia");
        write_mdhd(buf, track.timescale, media_duration(track), track.language.as_deref());
        write_hdlr(buf, track.kind);

        let minf_start = begin_box(buf, b"minf");
        write_media_header(buf, track.kind);
        write_dinf(buf);

        let stbl_start = begin_box(buf, b"stbl");
        write_stsd(buf, track);
        write_stts(buf, &track.samples);
        if !track.all_keyframes() {
            write_stss(buf, &track.samples);
        }
        if track.samples.iter().any(|s| s.composition_offset != 0) {
            write_ctts(buf, &track.samples);
        }
        write_stsc(buf, &layout.samples_per_chunk);
        write_stsz(buf, &track.samples);
        write_chunk_offsets(buf, &layout.chunk_offsets, base, use_co64);
        if track.kind.is_audio() && !track.samples.is_empty() {
            write_roll_groups(buf, track.samples.len() as u32);
        }
        end_box(buf, stbl_start);

        end_box(buf, minf_start);
        end_box(buf, mdia_start);
        end_box(buf, trak_start);
    }
}

/// Copy samples, merging runs that are contiguous in the source.
///
/// `floor(k)` is the lowest offset still needed once sample `k` was read.
fn copy_samples<S, O, F>(
    source: &mut S,
    samples: &[Sample],
    sink: &mut O,
    buffer: &mut [u8],
    floor: F,
) -> Result<()>
where
    S: SeekableSource + ?Sized,
    O: OutputSink + ?Sized,
    F: Fn(usize) -> u64,
{
    // (start, length, index of the last sample in the run)
    let mut run: Option<(u64, u64, usize)> = None;
    for (k, sample) in samples.iter().enumerate() {
        run = match run {
            Some((start, len, _)) if start + len == sample.offset => Some((start, len + sample.size as u64, k)),
            Some((start, len, last)) => {
                copy_range_releasing(source, start, len, sink, buffer, floor(last))?;
                Some((sample.offset, sample.size as u64, k))
            }
            None => Some((sample.offset, sample.size as u64, k)),
        };
    }
    if let Some((start, len, last)) = run {
        copy_range_releasing(source, start, len, sink, buffer, floor(last))?;
    }
    Ok(())
}

/// Sum of sample durations in the media timescale.
fn media_duration(track: &Track) -> u64 {
    let summed: u64 = track.samples.iter().map(|s| s.duration as u64).sum();
    if summed > 0 {
        summed
    } else {
        track.duration
    }
}

/// Track duration in the movie timescale.
fn movie_duration(track: &Track) -> u64 {
    (media_duration(track) as u128 * MOVIE_TIMESCALE as u128 / track.timescale.max(1) as u128) as u64
}

fn write_stts(buf: &mut BytesMut, samples: &[Sample]) {
    let mut entries: Vec<(u32, u32)> = Vec::new();
    for sample in samples {
        match entries.last_mut() {
            Some((count, delta)) if *delta == sample.duration => *count += 1,
            _ => entries.push((1, sample.duration)),
        }
    }

    let start = begin_full_box(buf, b"stts", 0, 0);
    buf.put_u32(entries.len() as u32);
    for (count, delta) in entries {
        buf.put_u32(count);
        buf.put_u32(delta);
    }
    end_box(buf, start);
}

fn write_stss(buf: &mut BytesMut, samples: &[Sample]) {
    let sync: Vec<u32> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.keyframe)
        .map(|(i, _)| i as u32 + 1)
        .collect();

    let start = begin_full_box(buf, b"stss", 0, 0);
    buf.put_u32(sync.len() as u32);
    for number in sync {
        buf.put_u32(number);
    }
    end_box(buf, start);
}

fn write_ctts(buf: &mut BytesMut, samples: &[Sample]) {
    let mut entries: Vec<(u32, i32)> = Vec::new();
    for sample in samples {
        match entries.last_mut() {
            Some((count, offset)) if *offset == sample.composition_offset => *count += 1,
            _ => entries.push((1, sample.composition_offset)),
        }
    }
    // version 1 allows negative offsets
    let version = if entries.iter().any(|(_, offset)| *offset < 0) { 1 } else { 0 };

    let start = begin_full_box(buf, b"ctts", version, 0);
    buf.put_u32(entries.len() as u32);
    for (count, offset) in entries {
        buf.put_u32(count);
        buf.put_i32(offset);
    }
    end_box(buf, start);
}

fn write_stsc(buf: &mut BytesMut, samples_per_chunk: &[u32]) {
    let mut entries: Vec<(u32, u32)> = Vec::new();
    for (i, &count) in samples_per_chunk.iter().enumerate() {
        if entries.last().map_or(true, |&(_, last)| last != count) {
            entries.push((i as u32 + 1, count));
        }
    }

    let start = begin_full_box(buf, b"stsc", 0, 0);
    buf.put_u32(entries.len() as u32);
    for (first_chunk, count) in entries {
        buf.put_u32(first_chunk);
        buf.put_u32(count);
        buf.put_u32(1); // sample description index
    }
    end_box(buf, start);
}

fn write_stsz(buf: &mut BytesMut, samples: &[Sample]) {
    let start = begin_full_box(buf, b"stsz", 0, 0);
    let uniform = samples
        .first()
        .map(|s| s.size)
        .filter(|&size| samples.iter().all(|s| s.size == size));

    match uniform {
        Some(size) => {
            buf.put_u32(size);
            buf.put_u32(samples.len() as u32);
        }
        None => {
            buf.put_u32(0);
            buf.put_u32(samples.len() as u32);
            for sample in samples {
                buf.put_u32(sample.size);
            }
        }
    }
    end_box(buf, start);
}

fn write_chunk_offsets(buf: &mut BytesMut, relative: &[u64], base: u64, use_co64: bool) {
    let start = begin_full_box(buf, if use_co64 { b"co64" } else { b"stco" }, 0, 0);
    buf.put_u32(relative.len() as u32);
    for offset in relative {
        if use_co64 {
            buf.put_u64(base + offset);
        } else {
            buf.put_u32((base + offset) as u32);
        }
    }
    end_box(buf, start);
}

/// AAC priming: every sample belongs to a `roll` group with distance -1.
fn write_roll_groups(buf: &mut BytesMut, sample_count: u32) {
    let sgpd = begin_full_box(buf, b"sgpd", 1, 0);
    buf.put_slice(b"roll");
    buf.put_u32(2); // default description length
    buf.put_u32(1); // entry count
    buf.put_i16(-1); // roll distance
    end_box(buf, sgpd);

    let sbgp = begin_full_box(buf, b"sbgp", 0, 0);
    buf.put_slice(b"roll");
    buf.put_u32(1); // entry count
    buf.put_u32(sample_count);
    buf.put_u32(1); // group description index
    end_box(buf, sbgp);
}
