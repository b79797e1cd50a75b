//! Ogg writer for Opus and Vorbis tracks taken out of WebM.

use super::{lacing_values, OggPage, FLAG_BOS, FLAG_CONTINUED, FLAG_EOS, MAX_PAGE_PAYLOAD, MAX_SEGMENTS};
use crate::plan::CopyPlan;
use crate::stream::{OutputSink, SeekableSource};
use crate::track::Track;
use crate::{Error, Result};
use bytes::BytesMut;

/// Opus granule positions always count 48 kHz samples.
pub const OPUS_GRANULE_RATE: u64 = 48_000;

const NS_PER_SECOND: u64 = 1_000_000_000;

/// Granule position of a page on which no packet ends.
const NO_GRANULE: u64 = u64::MAX;

/// `OpusTags` with an empty vendor string and no comments.
const OPUS_TAGS: &[u8] = b"OpusTags\x00\x00\x00\x00\x00\x00\x00\x00";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Opus,
    Vorbis,
}

/// Writes one audio track as an Ogg logical stream.
pub struct OggWriter {
    track: Track,
    codec: Codec,
    serial: u32,
    granule_rate: u64,
    page_ns: u64,
}

impl OggWriter {
    pub fn new(track: Track) -> Result<Self> {
        let codec = match track.codec_id.as_str() {
            "A_OPUS" => Codec::Opus,
            "A_VORBIS" => Codec::Vorbis,
            other => {
                return Err(Error::unsupported(format!(
                    "codec {} cannot be stored in Ogg",
                    other
                )))
            }
        };
        if track.codec_config.is_empty() {
            return Err(Error::unsupported(format!(
                "track {} has no codec private data",
                track.id
            )));
        }

        let granule_rate = match codec {
            Codec::Opus => OPUS_GRANULE_RATE,
            Codec::Vorbis => track
                .audio
                .map(|a| a.sample_rate.round() as u64)
                .filter(|&rate| rate > 0)
                .ok_or_else(|| Error::unsupported("Vorbis track without a sample rate"))?,
        };

        Ok(Self {
            serial: track.id as u32,
            track,
            codec,
            granule_rate,
            page_ns: NS_PER_SECOND,
        })
    }

    /// Override the bitstream serial number.
    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    /// Write the header pages and every audio page. Returns the number of bytes written.
    pub fn write<S, O>(&self, sources: &mut [S], sink: &mut O) -> Result<u64>
    where
        S: SeekableSource,
        O: OutputSink + ?Sized,
    {
        let start = sink.position();
        let mut sequence = 0;
        let samples = &self.track.samples;

        let (first, rest) = self.header_packets()?;
        self.write_page(sink, &mut sequence, FLAG_BOS, 0, &[first])?;
        let header_flags = if samples.is_empty() { FLAG_EOS } else { 0 };
        self.write_page(sink, &mut sequence, header_flags, 0, &rest)?;

        let track_refs = [&self.track];
        let plan = CopyPlan::per_sample(&track_refs, sources.len());
        plan.begin(sources);
        let source_index = self.track.source;
        if source_index >= sources.len() {
            return Err(Error::unsupported(format!(
                "track {} refers to missing source {}",
                self.track.id, source_index
            )));
        }

        let mut packets: Vec<Vec<u8>> = Vec::new();
        let mut released = Vec::new();
        let mut segments = 0;
        let mut page_end = 0;
        // The first entry of `packets` ends a packet begun on an earlier page
        let mut continued = 0;

        for (index, sample) in samples.iter().enumerate() {
            let time = self.packet_time_ns(index);
            let needed = lacing_values(sample.size as usize).len();

            if !packets.is_empty() && (time >= page_end || segments + needed > MAX_SEGMENTS) {
                let granule = self.granule_at(time);
                self.write_page(sink, &mut sequence, continued, granule, &packets)?;
                for span in released.drain(..) {
                    plan.finish_span(span, sources);
                }
                packets.clear();
                segments = 0;
                continued = 0;
            }
            if packets.is_empty() {
                page_end = (time / self.page_ns + 1) * self.page_ns;
            }

            let source = &mut sources[source_index];
            source.seek_to(sample.offset)?;
            let mut packet = source.read_vec(sample.size as usize)?;

            // Spill packets longer than one page over full pages
            while packet.len() >= MAX_PAGE_PAYLOAD {
                let rest = packet.split_off(MAX_PAGE_PAYLOAD);
                let segments = vec![255u8; MAX_SEGMENTS];
                self.emit_page(sink, &mut sequence, continued, NO_GRANULE, segments, packet)?;
                packet = rest;
                continued = FLAG_CONTINUED;
            }
            segments += lacing_values(packet.len()).len();
            packets.push(packet);
            released.push(index);
        }

        if let Some(last) = samples.last() {
            let end = self.packet_time_ns(samples.len() - 1) + self.track.ticks_to_ns(last.duration as u64);
            let granule = self.granule_at(end);
            self.write_page(sink, &mut sequence, FLAG_EOS | continued, granule, &packets)?;
            for span in released.drain(..) {
                plan.finish_span(span, sources);
            }
        }

        let written = sink.position() - start;
        tracing::debug!(
            "Wrote Ogg stream {:08X}: {} pages, {} packets, {} bytes",
            self.serial,
            sequence,
            samples.len(),
            written
        );
        Ok(written)
    }

    /// Packet for the BOS page, and the packets of the second header page.
    fn header_packets(&self) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
        match self.codec {
            Codec::Opus => Ok((self.track.codec_config.clone(), vec![OPUS_TAGS.to_vec()])),
            Codec::Vorbis => {
                let mut headers = split_xiph_lacing(&self.track.codec_config)?.into_iter();
                match (headers.next(), headers.next(), headers.next()) {
                    (Some(id), Some(comment), Some(setup)) => Ok((id, vec![comment, setup])),
                    _ => Err(Error::malformed("Vorbis codec private needs three headers")),
                }
            }
        }
    }

    /// Decode time of a packet including the codec delay.
    fn packet_time_ns(&self, index: usize) -> u64 {
        self.track.ticks_to_ns(self.track.samples[index].timestamp) + self.track.codec_delay
    }

    /// Granule position for a page ending at `time_ns`, rounded up.
    fn granule_at(&self, time_ns: u64) -> u64 {
        let scaled = time_ns as u128 * self.granule_rate as u128;
        scaled.div_ceil(NS_PER_SECOND as u128) as u64
    }

    fn write_page<O: OutputSink + ?Sized>(
        &self,
        sink: &mut O,
        sequence: &mut u32,
        flags: u8,
        granule_position: u64,
        packets: &[Vec<u8>],
    ) -> Result<()> {
        let mut segments = Vec::new();
        let mut payload = Vec::with_capacity(packets.iter().map(Vec::len).sum());
        for packet in packets {
            segments.extend(lacing_values(packet.len()));
            payload.extend_from_slice(packet);
        }
        if segments.len() > MAX_SEGMENTS {
            return Err(Error::unsupported(format!(
                "{} lacing values do not fit in one Ogg page",
                segments.len()
            )));
        }
        self.emit_page(sink, sequence, flags, granule_position, segments, payload)
    }

    fn emit_page<O: OutputSink + ?Sized>(
        &self,
        sink: &mut O,
        sequence: &mut u32,
        flags: u8,
        granule_position: u64,
        segments: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<()> {
        let page = OggPage {
            flags,
            granule_position,
            serial: self.serial,
            sequence: *sequence,
            segments,
            payload,
        };
        let mut buf = BytesMut::with_capacity(page.size());
        page.encode(&mut buf);
        sink.write_all(&buf)?;
        *sequence += 1;
        Ok(())
    }
}

/// Split Xiph-laced CodecPrivate (packet count - 1, then laced sizes).
fn split_xiph_lacing(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let (&count, mut rest) = data
        .split_first()
        .ok_or_else(|| Error::malformed("empty codec private"))?;

    let mut sizes = Vec::with_capacity(count as usize + 1);
    for _ in 0..count {
        let mut size = 0usize;
        loop {
            let (&value, tail) = rest
                .split_first()
                .ok_or_else(|| Error::malformed("truncated Xiph lacing"))?;
            rest = tail;
            size += value as usize;
            if value < 255 {
                break;
            }
        }
        sizes.push(size);
    }

    let laced: usize = sizes.iter().sum();
    if laced > rest.len() {
        return Err(Error::malformed("Xiph lacing exceeds codec private"));
    }
    sizes.push(rest.len() - laced);

    let mut packets = Vec::with_capacity(sizes.len());
    for size in sizes {
        let (packet, tail) = rest.split_at(size);
        packets.push(packet.to_vec());
        rest = tail;
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ogg::{collect_packets, OggPageReader};
    use crate::stream::MemorySource;
    use crate::track::{AudioParams, Sample, TrackKind};
    use crate::webm::tests::{opus_head, sample_webm, WebmFixture};
    use crate::webm::WebmFile;

    fn write_pages(writer: &OggWriter, data: Vec<u8>) -> (Vec<OggPage>, MemorySource) {
        let mut sources = vec![MemorySource::new(data)];
        let mut output = Vec::new();
        writer.write(&mut sources, &mut output).unwrap();
        let mut out = MemorySource::new(output);
        let pages = OggPageReader::new(&mut out).read_all().unwrap();
        (pages, sources.remove(0))
    }

    #[test]
    fn test_opus_from_webm() {
        let input = sample_webm(&WebmFixture::default());
        let mut source = MemorySource::new(input.clone());
        let webm = WebmFile::parse(&mut source, 0).unwrap();
        let audio = webm.tracks[1].clone();
        let expected_packets = audio.samples.len();

        let writer = OggWriter::new(audio).unwrap();
        let (pages, source) = write_pages(&writer, input);

        assert!(pages[0].is_bos());
        assert_eq!(pages[0].packets(), vec![opus_head().as_slice()]);
        assert_eq!(pages[1].packets(), vec![OPUS_TAGS]);
        assert!(pages.last().unwrap().is_eos());
        assert!(pages.iter().all(|p| p.serial == 2));
        for (i, page) in pages.iter().enumerate() {
            assert_eq!(page.sequence, i as u32);
        }

        let audio_packets: usize = pages[2..].iter().map(|p| p.packets().len()).sum();
        assert_eq!(audio_packets, expected_packets);
        // 100 packets of 20 ms, delayed by 6.5 ms: one page per second
        assert_eq!(pages.len(), 2 + 2);
        assert_eq!(pages[2].packets().len(), 50);
        assert_eq!(pages[2].granule_position, 48_312);

        let granules: Vec<u64> = pages[2..].iter().map(|p| p.granule_position).collect();
        assert!(granules.windows(2).all(|w| w[0] < w[1]));
        // 2 s of audio plus the codec delay, at 48 kHz
        assert_eq!(*granules.last().unwrap(), 96_000 + 312);
        assert_eq!(source.released(), source.bytes().len() as u64);
    }

    #[test]
    fn test_large_packets_split_pages_by_segments() {
        let mut track = Track::new(0, 9, TrackKind::Audio, "A_OPUS");
        track.codec_config = opus_head();
        track.samples = (0..10)
            .map(|i| Sample {
                offset: i * 8000,
                size: 8000,
                timestamp: i * 20,
                duration: 20,
                composition_offset: 0,
                keyframe: true,
            })
            .collect();

        let writer = OggWriter::new(track).unwrap().with_serial(0xABCD);
        let (pages, _) = write_pages(&writer, vec![0x42; 80_000]);

        // 8000 bytes need 32 lacing values, so 7 packets fill a page
        let counts: Vec<usize> = pages[2..].iter().map(|p| p.packets().len()).collect();
        assert_eq!(counts, vec![7, 3]);
        assert_eq!(pages[0].serial, 0xABCD);
    }

    #[test]
    fn test_packet_larger_than_a_page_continues() {
        let sizes = [100u64, 70_000, 50];
        let mut track = Track::new(0, 3, TrackKind::Audio, "A_OPUS");
        track.codec_config = opus_head();
        let mut offset = 0;
        track.samples = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let sample = Sample {
                    offset,
                    size: size as u32,
                    timestamp: i as u64 * 20,
                    duration: 20,
                    composition_offset: 0,
                    keyframe: true,
                };
                offset += size;
                sample
            })
            .collect();
        let data: Vec<u8> = (0..offset).map(|i| (i % 251) as u8).collect();

        let writer = OggWriter::new(track).unwrap();
        let (pages, source) = write_pages(&writer, data.clone());

        assert_eq!(pages.len(), 2 + 3);
        let (small, full, last) = (&pages[2], &pages[3], &pages[4]);
        assert_eq!(small.flags, 0);
        assert_eq!(small.packets().len(), 1);
        assert!(!full.is_continued());
        assert_eq!(full.segments, vec![255u8; MAX_SEGMENTS]);
        assert_eq!(full.granule_position, NO_GRANULE);
        assert_eq!(last.flags, FLAG_CONTINUED | FLAG_EOS);
        assert_ne!(last.granule_position, NO_GRANULE);

        let packets = collect_packets(&pages).unwrap();
        assert_eq!(packets.len(), 2 + 3);
        assert_eq!(packets[2], &data[..100]);
        assert_eq!(packets[3], &data[100..70_100]);
        assert_eq!(packets[4], &data[70_100..]);
        assert_eq!(source.released(), offset);
    }

    #[test]
    fn test_vorbis_headers_are_split() {
        let mut private = vec![2u8, 30, 10];
        private.extend(vec![1u8; 30]);
        private.extend(vec![3u8; 10]);
        private.extend(vec![5u8; 50]);

        let mut track = Track::new(0, 1, TrackKind::Audio, "A_VORBIS");
        track.codec_config = private;
        track.audio = Some(AudioParams {
            sample_rate: 44100.0,
            channels: 2,
            bit_depth: 0,
        });

        let writer = OggWriter::new(track).unwrap();
        let (pages, _) = write_pages(&writer, Vec::new());

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].packets(), vec![&[1u8; 30][..]]);
        let second: Vec<usize> = pages[1].packets().iter().map(|p| p.len()).collect();
        assert_eq!(second, vec![10, 50]);
        assert!(pages[1].is_eos());
    }

    #[test]
    fn test_rejects_other_codecs() {
        let mut track = Track::new(0, 1, TrackKind::Audio, "A_AAC");
        track.codec_config = vec![0x12, 0x10];
        assert!(OggWriter::new(track).is_err());

        let track = Track::new(0, 1, TrackKind::Audio, "A_OPUS");
        assert!(OggWriter::new(track).is_err());
    }

    #[test]
    fn test_split_xiph_lacing() {
        let mut data = vec![1u8, 255, 4];
        data.extend(vec![7u8; 259]);
        data.extend(vec![8u8; 2]);
        let packets = split_xiph_lacing(&data).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 259);
        assert_eq!(packets[1], vec![8, 8]);

        assert!(split_xiph_lacing(&[1, 200, 1]).is_err());
    }
}
