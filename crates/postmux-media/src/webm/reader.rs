//! WebM/Matroska reader over a [`SeekableSource`].
//!
//! Walks the Segment once, collecting Info, the track entries and a block
//! index from every Cluster. Frame payloads are never loaded; each block is
//! recorded as an offset and size into the source.

use super::ebml::{self, ids, Element};
use super::WebmFile;
use crate::stream::SeekableSource;
use crate::track::{AudioParams, Sample, Track, TrackKind, VideoParams};
use crate::{Error, Result};
use std::collections::HashMap;

/// Default TimecodeScale: one tick per millisecond.
pub const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;

const FLAG_KEYFRAME: u8 = 0x80;
const FLAG_LACING: u8 = 0x06;

/// A block as found in a cluster, before it is attached to its track.
#[derive(Debug, Clone, Copy)]
struct RawBlock {
    track_number: u64,
    /// Cluster timecode plus the relative timecode, in segment ticks.
    timecode: i64,
    keyframe: bool,
    offset: u64,
    size: u32,
    /// BlockDuration in segment ticks.
    duration: Option<u64>,
}

/// WebM reader.
pub struct WebmReader<'a, S: ?Sized> {
    source: &'a mut S,
    source_index: usize,
}

impl<'a, S: SeekableSource + ?Sized> WebmReader<'a, S> {
    /// Create a reader; `source_index` is recorded in every produced track.
    pub fn new(source: &'a mut S, source_index: usize) -> Self {
        Self {
            source,
            source_index,
        }
    }

    /// Parse the file and rewind the source.
    pub fn parse(&mut self) -> Result<WebmFile> {
        self.source.rewind()?;
        let length = self.source.length();
        if length < 4 {
            return Err(Error::unsupported("source too short for an EBML header"));
        }

        let header = ebml::read_element(self.source, length)
            .map_err(|_| Error::unsupported("not an EBML file"))?;
        if header.id != ids::EBML {
            return Err(Error::unsupported(format!(
                "not an EBML file (first id {:#X})",
                header.id
            )));
        }

        let mut webm = WebmFile {
            doc_type: self.parse_header(&header)?,
            timecode_scale: DEFAULT_TIMECODE_SCALE,
            duration: None,
            muxing_app: None,
            writing_app: None,
            tracks: Vec::new(),
            cluster_count: 0,
            has_cues: false,
        };

        let segment = self.find_segment(header.end(), length)?;
        tracing::debug!(
            "Segment at {} ({} bytes{})",
            segment.offset,
            segment.size,
            if segment.unknown_size { ", unknown size" } else { "" }
        );

        let mut blocks = Vec::new();
        let mut lacing = HashMap::new();
        let mut position = segment.data_offset;
        while position < segment.end() {
            self.source.seek_to(position)?;
            let element = ebml::read_element(self.source, segment.end())?;
            position = element.end();

            match element.id {
                ids::INFO => self.parse_info(&element, &mut webm)?,
                ids::TRACKS => {
                    webm.tracks = self.parse_tracks(&element, &mut lacing)?;
                }
                ids::CLUSTER => {
                    position = self.parse_cluster(&element, &mut blocks)?;
                    webm.cluster_count += 1;
                }
                ids::CUES => webm.has_cues = true,
                ids::VOID => {}
                other => tracing::trace!("Skipping element {:#X} at {}", other, element.offset),
            }
        }

        if webm.tracks.is_empty() {
            return Err(Error::malformed("WebM file has no tracks"));
        }

        for (number, laced) in lacing {
            if laced {
                tracing::warn!("Track {} is flagged as laced; laced blocks are rejected", number);
            }
        }

        self.assign_blocks(&mut webm, blocks)?;
        self.source.rewind()?;

        tracing::debug!(
            "Parsed WebM ({}): {} tracks, {} clusters",
            webm.doc_type,
            webm.tracks.len(),
            webm.cluster_count
        );
        Ok(webm)
    }

    /// Read the EBML header children and return the DocType.
    fn parse_header(&mut self, header: &Element) -> Result<String> {
        let mut doc_type = String::from("matroska");
        for child in self.children(header)? {
            if child.id == ids::DOC_TYPE {
                self.source.seek_to(child.data_offset)?;
                doc_type = ebml::read_string(self.source, &child)?;
            }
        }
        match doc_type.as_str() {
            "webm" | "matroska" => Ok(doc_type),
            other => Err(Error::unsupported(format!("unsupported EBML DocType '{}'", other))),
        }
    }

    fn find_segment(&mut self, mut position: u64, length: u64) -> Result<Element> {
        while position < length {
            self.source.seek_to(position)?;
            let element = ebml::read_element(self.source, length)?;
            if element.id == ids::SEGMENT {
                return Ok(element);
            }
            position = element.end();
        }
        Err(Error::malformed("no Segment element"))
    }

    /// Child headers of a master element, in file order.
    fn children(&mut self, parent: &Element) -> Result<Vec<Element>> {
        let mut children = Vec::new();
        let mut position = parent.data_offset;
        while position < parent.end() {
            self.source.seek_to(position)?;
            let child = ebml::read_element(self.source, parent.end())?;
            position = child.end();
            children.push(child);
        }
        Ok(children)
    }

    fn read_uint(&mut self, element: &Element) -> Result<u64> {
        self.source.seek_to(element.data_offset)?;
        ebml::read_uint(self.source, element)
    }

    fn read_float(&mut self, element: &Element) -> Result<f64> {
        self.source.seek_to(element.data_offset)?;
        ebml::read_float(self.source, element)
    }

    fn read_string(&mut self, element: &Element) -> Result<String> {
        self.source.seek_to(element.data_offset)?;
        ebml::read_string(self.source, element)
    }

    fn read_binary(&mut self, element: &Element) -> Result<Vec<u8>> {
        self.source.seek_to(element.data_offset)?;
        ebml::read_binary(self.source, element)
    }

    fn parse_info(&mut self, info: &Element, webm: &mut WebmFile) -> Result<()> {
        for child in self.children(info)? {
            match child.id {
                ids::TIMECODE_SCALE => {
                    let scale = self.read_uint(&child)?;
                    if scale == 0 {
                        return Err(Error::malformed("TimecodeScale is zero"));
                    }
                    webm.timecode_scale = scale;
                }
                ids::DURATION => webm.duration = Some(self.read_float(&child)?),
                ids::MUXING_APP => webm.muxing_app = Some(self.read_string(&child)?),
                ids::WRITING_APP => webm.writing_app = Some(self.read_string(&child)?),
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_tracks(&mut self, tracks: &Element, lacing: &mut HashMap<u64, bool>) -> Result<Vec<Track>> {
        let mut parsed = Vec::new();
        for entry in self.children(tracks)? {
            if entry.id != ids::TRACK_ENTRY {
                continue;
            }
            let (track, laced) = self.parse_track_entry(&entry)?;
            lacing.insert(track.id, laced);
            parsed.push(track);
        }
        Ok(parsed)
    }

    fn parse_track_entry(&mut self, entry: &Element) -> Result<(Track, bool)> {
        let mut track = Track::new(self.source_index, 0, TrackKind::Other, "");
        let mut laced = false;

        for child in self.children(entry)? {
            match child.id {
                ids::TRACK_NUMBER => track.id = self.read_uint(&child)?,
                ids::TRACK_TYPE => {
                    track.kind = match self.read_uint(&child)? {
                        1 => TrackKind::Video,
                        2 => TrackKind::Audio,
                        0x11 => TrackKind::Subtitle,
                        _ => TrackKind::Other,
                    }
                }
                ids::FLAG_LACING => laced = self.read_uint(&child)? != 0,
                ids::LANGUAGE => track.language = Some(self.read_string(&child)?),
                ids::CODEC_ID => track.codec_id = self.read_string(&child)?,
                ids::CODEC_PRIVATE => track.codec_config = self.read_binary(&child)?,
                ids::DEFAULT_DURATION => track.default_duration = Some(self.read_uint(&child)?),
                ids::CODEC_DELAY => track.codec_delay = self.read_uint(&child)?,
                ids::SEEK_PRE_ROLL => track.seek_pre_roll = self.read_uint(&child)?,
                ids::VIDEO => {
                    track.settings = Some(self.read_binary(&child)?);
                    track.video = Some(self.parse_video(&child)?);
                }
                ids::AUDIO => {
                    track.settings = Some(self.read_binary(&child)?);
                    track.audio = Some(self.parse_audio(&child)?);
                }
                _ => {}
            }
        }

        if track.id == 0 {
            return Err(Error::malformed(format!(
                "TrackEntry at {} has no TrackNumber",
                entry.offset
            )));
        }
        tracing::trace!(
            "Track {}: {} {} ({} bytes of codec private)",
            track.id,
            track.kind,
            track.codec_id,
            track.codec_config.len()
        );
        Ok((track, laced))
    }

    fn parse_video(&mut self, video: &Element) -> Result<VideoParams> {
        let mut params = VideoParams::default();
        for child in self.children(video)? {
            match child.id {
                ids::PIXEL_WIDTH => params.width = self.read_uint(&child)? as u32,
                ids::PIXEL_HEIGHT => params.height = self.read_uint(&child)? as u32,
                _ => {}
            }
        }
        Ok(params)
    }

    fn parse_audio(&mut self, audio: &Element) -> Result<AudioParams> {
        let mut params = AudioParams {
            sample_rate: 8000.0,
            channels: 1,
            bit_depth: 0,
        };
        for child in self.children(audio)? {
            match child.id {
                ids::SAMPLING_FREQUENCY => params.sample_rate = self.read_float(&child)?,
                ids::CHANNELS => params.channels = self.read_uint(&child)? as u16,
                ids::BIT_DEPTH => params.bit_depth = self.read_uint(&child)? as u16,
                _ => {}
            }
        }
        Ok(params)
    }

    /// Index the blocks of a cluster. Returns where the next Segment child starts.
    fn parse_cluster(&mut self, cluster: &Element, blocks: &mut Vec<RawBlock>) -> Result<u64> {
        let mut timecode: i64 = 0;
        let mut position = cluster.data_offset;

        while position < cluster.end() {
            self.source.seek_to(position)?;
            let child = ebml::read_element(self.source, cluster.end())?;

            // an unknown-sized cluster ends at the next top-level element
            if cluster.unknown_size && ids::is_top_level(child.id) {
                return Ok(child.offset);
            }
            position = child.end();

            match child.id {
                ids::TIMECODE => timecode = self.read_uint(&child)? as i64,
                ids::SIMPLE_BLOCK => {
                    if let Some(block) = self.parse_block(&child, timecode, None)? {
                        blocks.push(block);
                    }
                }
                ids::BLOCK_GROUP => {
                    if let Some(block) = self.parse_block_group(&child, timecode)? {
                        blocks.push(block);
                    }
                }
                _ => {}
            }
        }
        Ok(cluster.end())
    }

    fn parse_block_group(&mut self, group: &Element, timecode: i64) -> Result<Option<RawBlock>> {
        let mut block = None;
        let mut duration = None;
        let mut referenced = false;

        for child in self.children(group)? {
            match child.id {
                ids::BLOCK => block = Some(child),
                ids::BLOCK_DURATION => duration = Some(self.read_uint(&child)?),
                ids::REFERENCE_BLOCK => referenced = true,
                _ => {}
            }
        }

        let Some(block) = block else {
            return Ok(None);
        };
        Ok(self
            .parse_block(&block, timecode, Some(!referenced))?
            .map(|raw| RawBlock { duration, ..raw }))
    }

    /// Parse a SimpleBlock or Block header. `keyframe` overrides the flag bit.
    fn parse_block(
        &mut self,
        element: &Element,
        cluster_timecode: i64,
        keyframe: Option<bool>,
    ) -> Result<Option<RawBlock>> {
        self.source.seek_to(element.data_offset)?;
        let track_number = ebml::read_vint(self.source)?
            .ok_or_else(|| Error::malformed(format!("block at {} has no track number", element.offset)))?;

        let mut header = [0u8; 3];
        self.source.read_fully(&mut header)?;
        let header_end = self.source.position();
        if header_end > element.end() {
            return Err(Error::malformed(format!("block at {} is truncated", element.offset)));
        }

        let relative = i16::from_be_bytes([header[0], header[1]]) as i64;
        let flags = header[2];
        if flags & FLAG_LACING != 0 {
            return Err(Error::unsupported(format!(
                "laced block at {} (track {})",
                element.offset, track_number
            )));
        }

        let size = element.end() - header_end;
        if size == 0 {
            tracing::trace!("Dropping empty block at {}", element.offset);
            return Ok(None);
        }
        let size = u32::try_from(size)
            .map_err(|_| Error::malformed(format!("block at {} is too large", element.offset)))?;

        Ok(Some(RawBlock {
            track_number,
            timecode: cluster_timecode + relative,
            keyframe: keyframe.unwrap_or(flags & FLAG_KEYFRAME != 0),
            offset: header_end,
            size,
            duration: None,
        }))
    }

    /// Attach blocks to their tracks and derive sample timing.
    fn assign_blocks(&self, webm: &mut WebmFile, blocks: Vec<RawBlock>) -> Result<()> {
        let scale = webm.timecode_scale;
        // keep segment ticks when they map to a whole number per second
        let (timescale, tick) = if 1_000_000_000 % scale == 0 {
            ((1_000_000_000 / scale) as u32, 1u64)
        } else {
            (1_000_000_000u32, scale)
        };

        let index: HashMap<u64, usize> = webm
            .tracks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();
        let mut per_track: Vec<Vec<RawBlock>> = vec![Vec::new(); webm.tracks.len()];
        for block in blocks {
            match index.get(&block.track_number) {
                Some(&i) => per_track[i].push(block),
                None => tracing::warn!(
                    "Block at {} refers to unknown track {}",
                    block.offset,
                    block.track_number
                ),
            }
        }

        for (track, blocks) in webm.tracks.iter_mut().zip(per_track) {
            track.timescale = timescale;
            let default_ticks = track
                .default_duration
                .map(|ns| (ns as u128 * timescale as u128 / 1_000_000_000) as u64);

            let mut samples: Vec<Sample> = Vec::with_capacity(blocks.len());
            for block in &blocks {
                samples.push(Sample {
                    offset: block.offset,
                    size: block.size,
                    timestamp: block.timecode.max(0) as u64 * tick,
                    duration: 0,
                    composition_offset: 0,
                    keyframe: block.keyframe,
                });
            }

            for i in 0..samples.len() {
                let duration = match samples.get(i + 1) {
                    Some(next) if next.timestamp > samples[i].timestamp => {
                        next.timestamp - samples[i].timestamp
                    }
                    Some(_) => default_ticks.unwrap_or(0),
                    None => blocks[i]
                        .duration
                        .map(|d| d * tick)
                        .or(default_ticks)
                        .unwrap_or_else(|| i.checked_sub(1).map_or(0, |p| samples[p].duration as u64)),
                };
                samples[i].duration = u32::try_from(duration).map_err(|_| {
                    Error::malformed(format!("track {} has a sample lasting {} ticks", track.id, duration))
                })?;
            }

            track.samples = samples;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemorySource;
    use crate::webm::tests::{opus_head, sample_webm, WebmFixture};
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_tracks_and_blocks() {
        let fixture = WebmFixture::default();
        let data = sample_webm(&fixture);
        let mut source = MemorySource::new(data.clone());
        let webm = WebmReader::new(&mut source, 3).parse().unwrap();

        assert_eq!(webm.doc_type, "webm");
        assert_eq!(webm.timecode_scale, 1_000_000);
        assert_eq!(webm.tracks.len(), 2);
        assert_eq!(source.position(), 0);

        let video = &webm.tracks[0];
        assert_eq!(video.kind, TrackKind::Video);
        assert_eq!(video.codec_id, "V_VP9");
        assert_eq!(video.source, 3);
        assert_eq!(video.timescale, 1000);
        assert_eq!(video.video, Some(VideoParams { width: 320, height: 240 }));
        assert_eq!(video.samples.len(), fixture.video_frames);
        assert!(video.samples[0].keyframe);
        assert!(!video.samples[1].keyframe);
        assert_eq!(video.samples[1].timestamp, 40);
        assert_eq!(video.samples[0].duration, 40);

        let audio = &webm.tracks[1];
        assert_eq!(audio.kind, TrackKind::Audio);
        assert_eq!(audio.codec_config, opus_head());
        assert_eq!(audio.codec_delay, 6_500_000);
        assert_eq!(audio.audio.map(|a| a.channels), Some(2));
        assert_eq!(audio.samples.len(), fixture.audio_frames);
        assert!(audio.samples.iter().all(|s| s.keyframe && s.duration == 20));

        // offsets point at the frame bytes
        for sample in &audio.samples {
            let bytes = &data[sample.offset as usize..sample.end() as usize];
            assert!(bytes.iter().all(|&b| b == 0xA0));
        }
    }

    #[test]
    fn test_rejects_non_ebml() {
        let mut source = MemorySource::new(vec![0x42u8; 16]);
        assert_matches!(
            WebmReader::new(&mut source, 0).parse(),
            Err(Error::UnsupportedFormat(_))
        );

        let mut empty = MemorySource::new(Vec::new());
        assert_matches!(
            WebmReader::new(&mut empty, 0).parse(),
            Err(Error::UnsupportedFormat(_))
        );
    }

    #[test]
    fn test_truncated_file_is_malformed() {
        let data = sample_webm(&WebmFixture::default());
        let mut source = MemorySource::new(data[..data.len() / 2].to_vec());
        assert_matches!(
            WebmReader::new(&mut source, 0).parse(),
            Err(Error::MalformedContainer(_))
        );
    }

    #[test]
    fn test_laced_block_is_unsupported() {
        let fixture = WebmFixture {
            laced: true,
            ..WebmFixture::default()
        };
        let mut source = MemorySource::new(sample_webm(&fixture));
        assert_matches!(
            WebmReader::new(&mut source, 0).parse(),
            Err(Error::UnsupportedFormat(_))
        );
    }

    #[test]
    fn test_unknown_size_segment_and_clusters() {
        let fixture = WebmFixture {
            unknown_sizes: true,
            ..WebmFixture::default()
        };
        let mut source = MemorySource::new(sample_webm(&fixture));
        let webm = WebmReader::new(&mut source, 0).parse().unwrap();
        assert_eq!(webm.cluster_count, 2);
        assert_eq!(webm.tracks[0].samples.len(), fixture.video_frames);
        assert_eq!(webm.tracks[1].samples.len(), fixture.audio_frames);
    }
}
