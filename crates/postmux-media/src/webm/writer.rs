//! WebM writer.
//!
//! Output layout: EBML header, then a Segment holding SeekHead, Info,
//! Tracks, Cues and the Clusters. Every size is known before the first byte
//! is written, so the output is produced in one forward pass while sample
//! bytes are copied straight from the sources.

use super::ebml::{self, ids};
use crate::plan::CopyPlan;
use crate::stream::{copy_range_releasing, OutputSink, SeekableSource, QUEUE_BUFFER_SIZE};
use crate::track::{Track, TrackKind};
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};

/// Name written to MuxingApp and WritingApp.
pub const APP_NAME: &str = "postmux";

/// Output TimecodeScale: milliseconds.
const TIMECODE_SCALE: u64 = 1_000_000;

/// Target cluster length.
const CLUSTER_MS: u64 = 1000;

/// Size of the Segment and Cluster size fields.
const MASTER_SIZE_LEN: usize = 8;

/// One block of the output.
#[derive(Debug, Clone, Copy)]
struct Block {
    track: usize,
    sample: usize,
    /// Timecode relative to the cluster.
    relative: i16,
    keyframe: bool,
    /// BlockDuration for a trailing BlockGroup.
    duration: Option<u64>,
    /// ReferenceBlock value for a non-key BlockGroup.
    reference: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
struct Cluster {
    timecode: u64,
    first_block: usize,
    block_count: usize,
    payload_size: u64,
}

/// Writes selected tracks into a new WebM file.
pub struct WebmWriter {
    tracks: Vec<Track>,
}

impl WebmWriter {
    pub fn new(tracks: Vec<Track>) -> Result<Self> {
        if tracks.is_empty() {
            return Err(Error::unsupported("no tracks selected"));
        }
        if tracks.len() > 126 {
            return Err(Error::unsupported(format!("{} tracks selected", tracks.len())));
        }
        if let Some(track) = tracks
            .iter()
            .find(|t| !is_matroska_codec(&t.codec_id) || t.timescale == 0)
        {
            return Err(Error::unsupported(format!(
                "track {} ({}) cannot be stored in WebM",
                track.id, track.codec_id
            )));
        }
        Ok(Self { tracks })
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Write the file. Returns the number of bytes written.
    pub fn write<S, O>(&self, sources: &mut [S], sink: &mut O) -> Result<u64>
    where
        S: SeekableSource,
        O: OutputSink + ?Sized,
    {
        let track_refs: Vec<&Track> = self.tracks.iter().collect();
        let plan = CopyPlan::per_sample(&track_refs, sources.len());
        let (blocks, clusters) = self.layout(&plan)?;

        let info = self.build_info();
        let tracks = self.build_tracks();

        // Cues and SeekHead use fixed-width values, so a dry run gives their size
        let cues_len = build_cues(&clusters, &[], &blocks).len() as u64;
        let seek_head_len = build_seek_head(0, 0, 0).len() as u64;

        let info_pos = seek_head_len;
        let tracks_pos = info_pos + info.len() as u64;
        let cues_pos = tracks_pos + tracks.len() as u64;
        let clusters_pos = cues_pos + cues_len;

        let mut cluster_positions = Vec::with_capacity(clusters.len());
        let mut position = clusters_pos;
        for cluster in &clusters {
            cluster_positions.push(position);
            position += 4 + MASTER_SIZE_LEN as u64 + cluster.payload_size;
        }
        let segment_size = position;

        let cues = build_cues(&clusters, &cluster_positions, &blocks);
        let seek_head = build_seek_head(info_pos, tracks_pos, cues_pos);

        let mut head = BytesMut::with_capacity(256 + info.len() + tracks.len() + cues.len());
        write_ebml_header(&mut head);
        ebml::put_id(&mut head, ids::SEGMENT);
        ebml::put_vint(&mut head, segment_size, MASTER_SIZE_LEN);
        head.put_slice(&seek_head);
        head.put_slice(&info);
        head.put_slice(&tracks);
        head.put_slice(&cues);

        plan.begin(sources);
        let start = sink.position();
        sink.write_all(&head)?;

        let mut buffer = vec![0u8; QUEUE_BUFFER_SIZE];
        let mut span = 0;
        for cluster in &clusters {
            let mut header = BytesMut::with_capacity(32);
            ebml::put_id(&mut header, ids::CLUSTER);
            ebml::put_vint(&mut header, cluster.payload_size, MASTER_SIZE_LEN);
            ebml::put_uint(&mut header, ids::TIMECODE, cluster.timecode);
            sink.write_all(&header)?;

            for block in &blocks[cluster.first_block..cluster.first_block + cluster.block_count] {
                let track = &self.tracks[block.track];
                let sample = &track.samples[block.sample];
                sink.write_all(&block_head(block, sample.size))?;

                let source = sources.get_mut(track.source).ok_or_else(|| {
                    Error::unsupported(format!("track {} refers to missing source {}", track.id, track.source))
                })?;
                let floor = plan.floor(span, 0);
                copy_range_releasing(source, sample.offset, sample.size as u64, sink, &mut buffer, floor)?;

                let trailer = block_trailer(block);
                if !trailer.is_empty() {
                    sink.write_all(&trailer)?;
                }
                plan.finish_span(span, sources);
                span += 1;
            }
        }

        let written = sink.position() - start;
        tracing::debug!(
            "Wrote WebM: {} tracks, {} clusters, {} bytes",
            self.tracks.len(),
            clusters.len(),
            written
        );
        Ok(written)
    }

    /// Assign every sample to a block and cut the blocks into clusters.
    fn layout(&self, plan: &CopyPlan) -> Result<(Vec<Block>, Vec<Cluster>)> {
        let has_video = self.tracks.iter().any(|t| t.kind.is_video());
        let mut blocks = Vec::with_capacity(plan.spans().len());
        let mut clusters: Vec<Cluster> = Vec::new();

        for span in plan.spans() {
            let track = &self.tracks[span.track];
            let sample = &track.samples[span.first];
            let time = span.time_ns / TIMECODE_SCALE;

            let start_new = match clusters.last() {
                None => true,
                Some(cluster) => {
                    let elapsed = time.saturating_sub(cluster.timecode);
                    elapsed > i16::MAX as u64
                        || (elapsed >= CLUSTER_MS
                            && (!has_video || (track.kind.is_video() && sample.keyframe)))
                }
            };
            if start_new {
                clusters.push(Cluster {
                    timecode: time,
                    first_block: blocks.len(),
                    block_count: 0,
                    payload_size: ebml::element_size(ids::TIMECODE, uint_width(time) as u64),
                });
            }

            let cluster = clusters
                .last_mut()
                .ok_or_else(|| Error::malformed("no cluster open"))?;
            let relative = i16::try_from(time.saturating_sub(cluster.timecode))
                .map_err(|_| Error::malformed(format!("block at {} ms does not fit its cluster", time)))?;

            let mut block = Block {
                track: span.track,
                sample: span.first,
                relative,
                keyframe: sample.keyframe,
                duration: None,
                reference: None,
            };

            // keep the duration of a track's last frame when it differs from the default
            if span.first + 1 == track.samples.len() {
                let duration_ms = track.ticks_to_ns(sample.duration as u64) / TIMECODE_SCALE;
                let default_ms = track.default_duration.map(|ns| ns / TIMECODE_SCALE);
                if duration_ms > 0 && default_ms != Some(duration_ms) {
                    block.duration = Some(duration_ms);
                    if !sample.keyframe {
                        let previous = span
                            .first
                            .checked_sub(1)
                            .map(|p| track.ticks_to_ns(track.samples[p].timestamp) / TIMECODE_SCALE)
                            .unwrap_or(time);
                        block.reference = Some(previous as i64 - time as i64);
                    }
                }
            }

            cluster.payload_size += block_size(&block, sample.size);
            cluster.block_count += 1;
            blocks.push(block);
        }

        Ok((blocks, clusters))
    }

    fn build_info(&self) -> BytesMut {
        let duration_ms = self
            .tracks
            .iter()
            .map(|t| t.ticks_to_ns(t.effective_duration()) as f64 / TIMECODE_SCALE as f64)
            .fold(0.0, f64::max);

        let mut buf = BytesMut::with_capacity(64);
        let start = ebml::begin_master(&mut buf, ids::INFO);
        ebml::put_uint(&mut buf, ids::TIMECODE_SCALE, TIMECODE_SCALE);
        ebml::put_string(&mut buf, ids::MUXING_APP, APP_NAME);
        ebml::put_string(&mut buf, ids::WRITING_APP, APP_NAME);
        ebml::put_float(&mut buf, ids::DURATION, duration_ms);
        ebml::end_master(&mut buf, start);
        buf
    }

    fn build_tracks(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256);
        let start = ebml::begin_master(&mut buf, ids::TRACKS);
        for (i, track) in self.tracks.iter().enumerate() {
            let entry = ebml::begin_master(&mut buf, ids::TRACK_ENTRY);
            let number = i as u64 + 1;
            ebml::put_uint(&mut buf, ids::TRACK_NUMBER, number);
            ebml::put_uint(&mut buf, ids::TRACK_UID, number);
            ebml::put_uint(&mut buf, ids::TRACK_TYPE, track_type(track.kind));
            ebml::put_uint(&mut buf, ids::FLAG_LACING, 0);
            if let Some(language) = &track.language {
                ebml::put_string(&mut buf, ids::LANGUAGE, language);
            }
            ebml::put_string(&mut buf, ids::CODEC_ID, &track.codec_id);
            if !track.codec_config.is_empty() {
                ebml::put_element(&mut buf, ids::CODEC_PRIVATE, &track.codec_config);
            }
            if let Some(duration) = track.default_duration {
                ebml::put_uint(&mut buf, ids::DEFAULT_DURATION, duration);
            }
            if track.codec_delay > 0 {
                ebml::put_uint(&mut buf, ids::CODEC_DELAY, track.codec_delay);
            }
            if track.seek_pre_roll > 0 {
                ebml::put_uint(&mut buf, ids::SEEK_PRE_ROLL, track.seek_pre_roll);
            }
            write_settings(&mut buf, track);
            ebml::end_master(&mut buf, entry);
        }
        ebml::end_master(&mut buf, start);
        buf
    }
}

/// Matroska codec IDs look like `V_VP9`, `A_OPUS`, `S_TEXT/WEBVTT`.
fn is_matroska_codec(codec_id: &str) -> bool {
    let bytes = codec_id.as_bytes();
    bytes.len() > 2 && bytes[1] == b'_' && bytes[0].is_ascii_uppercase()
}

fn track_type(kind: TrackKind) -> u64 {
    match kind {
        TrackKind::Video => 1,
        TrackKind::Audio => 2,
        TrackKind::Subtitle => 0x11,
        TrackKind::Other => 0x21,
    }
}

/// Video or Audio element, verbatim when the source carried one.
fn write_settings(buf: &mut BytesMut, track: &Track) {
    let id = match track.kind {
        TrackKind::Video => ids::VIDEO,
        TrackKind::Audio => ids::AUDIO,
        _ => return,
    };
    if let Some(settings) = &track.settings {
        ebml::put_element(buf, id, settings);
        return;
    }

    let mut payload = BytesMut::new();
    if let Some(video) = track.video {
        ebml::put_uint(&mut payload, ids::PIXEL_WIDTH, video.width as u64);
        ebml::put_uint(&mut payload, ids::PIXEL_HEIGHT, video.height as u64);
    }
    if let Some(audio) = track.audio {
        ebml::put_float(&mut payload, ids::SAMPLING_FREQUENCY, audio.sample_rate);
        ebml::put_uint(&mut payload, ids::CHANNELS, audio.channels as u64);
        if audio.bit_depth > 0 {
            ebml::put_uint(&mut payload, ids::BIT_DEPTH, audio.bit_depth as u64);
        }
    }
    if !payload.is_empty() {
        ebml::put_element(buf, id, &payload);
    }
}

fn write_ebml_header(buf: &mut BytesMut) {
    let start = ebml::begin_master(buf, ids::EBML);
    ebml::put_uint(buf, ids::EBML_VERSION, 1);
    ebml::put_uint(buf, ids::EBML_READ_VERSION, 1);
    ebml::put_uint(buf, ids::EBML_MAX_ID_LENGTH, 4);
    ebml::put_uint(buf, ids::EBML_MAX_SIZE_LENGTH, 8);
    ebml::put_string(buf, ids::DOC_TYPE, "webm");
    ebml::put_uint(buf, ids::DOC_TYPE_VERSION, 4);
    ebml::put_uint(buf, ids::DOC_TYPE_READ_VERSION, 2);
    ebml::end_master(buf, start);
}

/// SeekHead pointing at Info, Tracks and Cues (positions relative to the Segment payload).
fn build_seek_head(info: u64, tracks: u64, cues: u64) -> BytesMut {
    let mut buf = BytesMut::with_capacity(96);
    let start = ebml::begin_master(&mut buf, ids::SEEK_HEAD);
    for (id, position) in [(ids::INFO, info), (ids::TRACKS, tracks), (ids::CUES, cues)] {
        let seek = ebml::begin_master(&mut buf, ids::SEEK);
        ebml::put_element(&mut buf, ids::SEEK_ID, &id.to_be_bytes());
        ebml::put_uint_fixed(&mut buf, ids::SEEK_POSITION, position, 8);
        ebml::end_master(&mut buf, seek);
    }
    ebml::end_master(&mut buf, start);
    buf
}

/// One CuePoint per cluster. An empty `positions` slice writes zeros.
fn build_cues(clusters: &[Cluster], positions: &[u64], blocks: &[Block]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64 + clusters.len() * 48);
    let start = ebml::begin_master(&mut buf, ids::CUES);
    for (i, cluster) in clusters.iter().enumerate() {
        let track = blocks.get(cluster.first_block).map_or(1, |b| b.track as u64 + 1);
        let point = ebml::begin_master(&mut buf, ids::CUE_POINT);
        ebml::put_uint_fixed(&mut buf, ids::CUE_TIME, cluster.timecode, 8);
        let positions_start = ebml::begin_master(&mut buf, ids::CUE_TRACK_POSITIONS);
        ebml::put_uint_fixed(&mut buf, ids::CUE_TRACK, track, 8);
        ebml::put_uint_fixed(
            &mut buf,
            ids::CUE_CLUSTER_POSITION,
            positions.get(i).copied().unwrap_or(0),
            8,
        );
        ebml::end_master(&mut buf, positions_start);
        ebml::end_master(&mut buf, point);
    }
    ebml::end_master(&mut buf, start);
    buf
}

/// Smallest width `put_uint` uses for `value`.
fn uint_width(value: u64) -> usize {
    (((64 - value.leading_zeros() as usize) + 7) / 8).max(1)
}

/// Track number, relative timecode and flags.
fn block_header(block: &Block, flags: u8) -> [u8; 4] {
    let relative = block.relative.to_be_bytes();
    [0x80 | (block.track as u8 + 1), relative[0], relative[1], flags]
}

fn group_trailer(block: &Block, duration: u64) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16);
    ebml::put_uint(&mut buf, ids::BLOCK_DURATION, duration);
    if let Some(reference) = block.reference {
        ebml::put_int(&mut buf, ids::REFERENCE_BLOCK, reference);
    }
    buf
}

/// Everything written before the frame bytes of `block`.
fn block_head(block: &Block, size: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(32);
    let block_payload = 4 + size as u64;
    match block.duration {
        None => {
            let flags = if block.keyframe { 0x80 } else { 0 };
            ebml::put_id(&mut buf, ids::SIMPLE_BLOCK);
            ebml::put_vint(&mut buf, block_payload, ebml::vint_len(block_payload));
            buf.put_slice(&block_header(block, flags));
        }
        Some(duration) => {
            let group_payload =
                ebml::element_size(ids::BLOCK, block_payload) + group_trailer(block, duration).len() as u64;
            ebml::put_id(&mut buf, ids::BLOCK_GROUP);
            ebml::put_vint(&mut buf, group_payload, ebml::vint_len(group_payload));
            ebml::put_id(&mut buf, ids::BLOCK);
            ebml::put_vint(&mut buf, block_payload, ebml::vint_len(block_payload));
            buf.put_slice(&block_header(block, 0));
        }
    }
    buf
}

/// Everything written after the frame bytes of `block`.
fn block_trailer(block: &Block) -> BytesMut {
    match block.duration {
        Some(duration) => group_trailer(block, duration),
        None => BytesMut::new(),
    }
}

fn block_size(block: &Block, size: u32) -> u64 {
    block_head(block, size).len() as u64 + size as u64 + block_trailer(block).len() as u64
}
