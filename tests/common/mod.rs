//! Fixture builders shared by the integration tests.
//!
//! Every media file is produced by the crate's own writers from an in-memory
//! payload, so the tests only depend on public API.

#![allow(dead_code)]

use postmux_media::stream::MemorySource;
use postmux_media::track::{AudioParams, VideoParams};
use postmux_media::{DashWriter, Sample, Track, TrackKind, WebmWriter};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Temporary directory holding the files of one test.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, data).expect("Failed to write fixture");
        path
    }
}

pub fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).expect("Failed to read file")
}

/// Lay `sizes` out back to back and build the matching samples.
///
/// Each sample is filled with its index so misplaced copies are detectable.
fn payload(sizes: &[u32], duration: u32, keyframe: impl Fn(usize) -> bool) -> (Vec<u8>, Vec<Sample>) {
    let mut data = Vec::new();
    let mut samples = Vec::with_capacity(sizes.len());
    for (i, &size) in sizes.iter().enumerate() {
        samples.push(Sample {
            offset: data.len() as u64,
            size,
            timestamp: i as u64 * duration as u64,
            duration,
            composition_offset: 0,
            keyframe: keyframe(i),
        });
        data.extend(std::iter::repeat(i as u8).take(size as usize));
    }
    (data, samples)
}

pub fn opus_head() -> Vec<u8> {
    let mut head = b"OpusHead".to_vec();
    head.push(1); // version
    head.push(2); // channels
    head.extend_from_slice(&312u16.to_le_bytes()); // pre-skip
    head.extend_from_slice(&48000u32.to_le_bytes());
    head.extend_from_slice(&0u16.to_le_bytes()); // output gain
    head.push(0); // mapping family
    head
}

fn opus_track(source: usize, id: u64, samples: Vec<Sample>) -> Track {
    let mut track = Track::new(source, id, TrackKind::Audio, "A_OPUS");
    track.codec_config = opus_head();
    track.codec_delay = 6_500_000;
    track.seek_pre_roll = 80_000_000;
    track.audio = Some(AudioParams {
        sample_rate: 48000.0,
        channels: 2,
        bit_depth: 0,
    });
    track.samples = samples;
    track
}

fn vp9_track(source: usize, id: u64, samples: Vec<Sample>) -> Track {
    let mut track = Track::new(source, id, TrackKind::Video, "V_VP9");
    track.video = Some(VideoParams {
        width: 320,
        height: 240,
    });
    track.samples = samples;
    track
}

fn write_webm(tracks: Vec<Track>, data: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::new();
    WebmWriter::new(tracks)
        .expect("WebM tracks")
        .write(&mut [MemorySource::new(data)], &mut out)
        .expect("WebM write");
    out
}

/// Audio-only WebM with `frames` 20 ms Opus frames.
pub fn opus_webm(frames: usize) -> Vec<u8> {
    let sizes: Vec<u32> = (0..frames).map(|i| 30 + (i % 5) as u32).collect();
    let (data, samples) = payload(&sizes, 20, |_| true);
    write_webm(vec![opus_track(0, 1, samples)], data)
}

/// Video-only WebM with `frames` 40 ms VP9 frames, a keyframe every 25.
pub fn vp9_webm(frames: usize) -> Vec<u8> {
    let sizes: Vec<u32> = (0..frames).map(|i| 100 + (i % 7) as u32).collect();
    let (data, samples) = payload(&sizes, 40, |i| i % 25 == 0);
    write_webm(vec![vp9_track(0, 1, samples)], data)
}

/// Audio-only WebM with a Vorbis-style track carrying `private_len` bytes of
/// CodecPrivate, which makes the header of any file merging it large.
pub fn bulky_audio_webm(frames: usize, private_len: usize) -> Vec<u8> {
    let sizes: Vec<u32> = (0..frames).map(|i| 40 + (i % 3) as u32).collect();
    let (data, samples) = payload(&sizes, 20, |_| true);
    let mut track = opus_track(0, 1, samples);
    track.codec_id = "A_VORBIS".into();
    track.codec_config = vec![0x5A; private_len];
    track.codec_delay = 0;
    track.seek_pre_roll = 0;
    write_webm(vec![track], data)
}

/// WebM with a single-frame video track (cover art) followed by Opus audio.
pub fn cover_and_opus_webm(frames: usize) -> Vec<u8> {
    let (mut data, cover) = payload(&[2048], 20 * frames as u32, |_| true);
    let sizes: Vec<u32> = (0..frames).map(|i| 30 + (i % 5) as u32).collect();
    let (audio_data, mut audio) = payload(&sizes, 20, |_| true);
    let base = data.len() as u64;
    for sample in audio.iter_mut() {
        sample.offset += base;
    }
    data.extend_from_slice(&audio_data);
    write_webm(vec![vp9_track(0, 1, cover), opus_track(0, 2, audio)], data)
}

fn mp4_box(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(8 + body.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

/// `mp4a` sample entry: stereo, 16 bit, 44.1 kHz, with a short esds.
pub fn mp4a_entry() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0; 6]); // reserved
    body.extend_from_slice(&1u16.to_be_bytes()); // data reference index
    body.extend_from_slice(&[0; 8]); // reserved
    body.extend_from_slice(&2u16.to_be_bytes()); // channels
    body.extend_from_slice(&16u16.to_be_bytes()); // sample size
    body.extend_from_slice(&[0; 4]); // pre_defined + reserved
    body.extend_from_slice(&(44100u32 << 16).to_be_bytes());
    let mut esds = vec![0, 0, 0, 0];
    esds.extend_from_slice(&[0x03, 0x05, 0x00, 0x01, 0x00, 0x12, 0x10]);
    body.extend_from_slice(&mp4_box(b"esds", &esds));
    mp4_box(b"mp4a", &body)
}

/// `avc1` sample entry for 640x360 with a stub avcC.
pub fn avc1_entry() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0; 6]); // reserved
    body.extend_from_slice(&1u16.to_be_bytes()); // data reference index
    body.extend_from_slice(&[0; 16]); // pre_defined + reserved
    body.extend_from_slice(&640u16.to_be_bytes());
    body.extend_from_slice(&360u16.to_be_bytes());
    body.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi
    body.extend_from_slice(&0x0048_0000u32.to_be_bytes());
    body.extend_from_slice(&[0; 4]); // reserved
    body.extend_from_slice(&1u16.to_be_bytes()); // frame count
    body.extend_from_slice(&[0; 32]); // compressor name
    body.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
    body.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined
    body.extend_from_slice(&mp4_box(b"avcC", &[0x01, 0x64, 0x00, 0x1E, 0xFF, 0xE0, 0x00]));
    mp4_box(b"avc1", &body)
}

fn write_dash(track: Track, data: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::new();
    DashWriter::new(vec![track])
        .expect("DASH tracks")
        .write(&mut [MemorySource::new(data)], &mut out)
        .expect("DASH write");
    out
}

/// Fragmented AAC audio: `count` frames of 1024 samples at 44.1 kHz.
pub fn dash_audio(count: usize) -> Vec<u8> {
    let sizes: Vec<u32> = (0..count).map(|i| 200 + (i % 5) as u32).collect();
    let (data, samples) = payload(&sizes, 1024, |_| true);
    let mut track = Track::new(0, 1, TrackKind::Audio, "mp4a");
    track.codec_config = mp4a_entry();
    track.timescale = 44100;
    track.audio = Some(AudioParams {
        sample_rate: 44100.0,
        channels: 2,
        bit_depth: 16,
    });
    track.samples = samples;
    write_dash(track, data)
}

/// Fragmented H.264 video: `count` frames at 30 fps, a keyframe every 30.
pub fn dash_video(count: usize) -> Vec<u8> {
    let sizes: Vec<u32> = (0..count).map(|i| 500 + (i % 11) as u32).collect();
    dash_video_sized(&sizes)
}

/// Fragmented H.264 video with `count` frames of `size` bytes each.
pub fn dash_video_frames(count: usize, size: u32) -> Vec<u8> {
    dash_video_sized(&vec![size; count])
}

fn dash_video_sized(sizes: &[u32]) -> Vec<u8> {
    let (data, samples) = payload(sizes, 3000, |i| i % 30 == 0);
    let mut track = Track::new(0, 1, TrackKind::Video, "avc1");
    track.codec_config = avc1_entry();
    track.timescale = 90000;
    track.video = Some(VideoParams {
        width: 640,
        height: 360,
    });
    track.samples = samples;
    write_dash(track, data)
}

pub const TTML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<tt xmlns="http://www.w3.org/ns/ttml" xml:lang="en">
  <body>
    <div>
      <p begin="00:00:01.000" end="00:00:02.500">Hello<br/>world</p>
      <p begin="00:00:03.000" end="00:00:04.000"></p>
      <p begin="00:00:05.000" end="00:00:06.000">Tom &amp; Jerry</p>
    </div>
  </body>
</tt>
"#;

pub const TTML_AS_SRT: &str =
    "1\r\n00:00:01,000 --> 00:00:02,500\r\nHello\r\nworld\r\n\r\n2\r\n00:00:05,000 --> 00:00:06,000\r\nTom & Jerry\r\n\r\n";
