//! Container-neutral track model shared by readers and writers.

use crate::{Error, Result};
#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

/// Kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

impl TrackKind {
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Audio)
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// One coded access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct Sample {
    /// Byte offset in the originating source.
    pub offset: u64,
    /// Size in bytes, always > 0.
    pub size: u32,
    /// Decode timestamp in track timescale units.
    pub timestamp: u64,
    /// Duration in track timescale units.
    pub duration: u32,
    /// Composition time offset (pts - dts).
    pub composition_offset: i32,
    /// Sync sample.
    pub keyframe: bool,
}

impl Sample {
    /// Presentation timestamp, clamped at zero.
    pub fn pts(&self) -> u64 {
        (self.timestamp as i64 + self.composition_offset as i64).max(0) as u64
    }

    /// Byte offset just past the sample.
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }
}

/// Video parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
}

/// Audio parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct AudioParams {
    pub sample_rate: f64,
    pub channels: u16,
    pub bit_depth: u16,
}

/// Normalized track: codec parameters plus the ordered sample list.
///
/// Built once by a reader and consumed read-only by a writer.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct Track {
    /// Index of the source the samples live in.
    pub source: usize,
    /// Track number in the source container.
    pub id: u64,
    pub kind: TrackKind,
    /// Matroska codec ID (`V_VP9`, `A_OPUS`) or MP4 sample entry fourcc (`avc1`).
    pub codec_id: String,
    /// CodecPrivate for WebM, the complete sample entry box for MP4.
    pub codec_config: Vec<u8>,
    /// Ticks per second for `timestamp`, `duration` and sample times.
    pub timescale: u32,
    /// Duration in timescale units, 0 if unknown.
    pub duration: u64,
    /// ISO-639-2 language code.
    pub language: Option<String>,
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
    /// Decoder delay in nanoseconds.
    pub codec_delay: u64,
    /// Seek pre-roll in nanoseconds.
    pub seek_pre_roll: u64,
    /// Default frame duration in nanoseconds.
    pub default_duration: Option<u64>,
    /// Edit list media time in timescale units.
    pub media_time: i64,
    /// Raw Video/Audio element payload of a WebM track entry.
    pub settings: Option<Vec<u8>>,
    pub samples: Vec<Sample>,
}

impl Track {
    /// Create an empty track.
    pub fn new(source: usize, id: u64, kind: TrackKind, codec_id: impl Into<String>) -> Self {
        Self {
            source,
            id,
            kind,
            codec_id: codec_id.into(),
            codec_config: Vec::new(),
            timescale: 1000,
            duration: 0,
            language: None,
            video: None,
            audio: None,
            codec_delay: 0,
            seek_pre_roll: 0,
            default_duration: None,
            media_time: 0,
            settings: None,
            samples: Vec::new(),
        }
    }

    /// Total payload size of all samples.
    pub fn total_size(&self) -> u64 {
        self.samples.iter().map(|s| s.size as u64).sum()
    }

    /// Duration derived from the samples when the header carries none.
    pub fn effective_duration(&self) -> u64 {
        if self.duration > 0 {
            return self.duration;
        }
        self.samples
            .last()
            .map(|s| s.timestamp + s.duration as u64)
            .unwrap_or(0)
    }

    /// Convert track ticks to nanoseconds.
    pub fn ticks_to_ns(&self, ticks: u64) -> u64 {
        if self.timescale == 0 {
            return 0;
        }
        (ticks as u128 * 1_000_000_000 / self.timescale as u128) as u64
    }

    /// Duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.timescale == 0 {
            0.0
        } else {
            self.effective_duration() as f64 / self.timescale as f64
        }
    }

    /// Whether every sample is a sync sample.
    pub fn all_keyframes(&self) -> bool {
        self.samples.iter().all(|s| s.keyframe)
    }
}

/// Index of the first track of the given kind.
pub fn find_track(tracks: &[Track], kind: TrackKind) -> Option<usize> {
    tracks.iter().position(|t| t.kind == kind)
}

/// Pick one track per source: `indexes[i]` selects from `per_source[i]`.
pub fn select_tracks(per_source: &[Vec<Track>], indexes: &[usize]) -> Result<Vec<Track>> {
    if indexes.len() != per_source.len() {
        return Err(Error::unsupported(format!(
            "{} track indexes given for {} sources",
            indexes.len(),
            per_source.len()
        )));
    }
    per_source
        .iter()
        .zip(indexes)
        .enumerate()
        .map(|(source, (tracks, &index))| {
            tracks.get(index).cloned().ok_or_else(|| {
                Error::unsupported(format!(
                    "source {} has {} tracks, index {} requested",
                    source,
                    tracks.len(),
                    index
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(timestamp: u64, duration: u32) -> Sample {
        Sample {
            offset: 0,
            size: 10,
            timestamp,
            duration,
            composition_offset: 0,
            keyframe: true,
        }
    }

    #[test]
    fn test_sample_pts() {
        let mut s = sample(1000, 40);
        s.composition_offset = 500;
        assert_eq!(s.pts(), 1500);

        s.timestamp = 100;
        s.composition_offset = -200;
        assert_eq!(s.pts(), 0);
    }

    #[test]
    fn test_effective_duration() {
        let mut track = Track::new(0, 1, TrackKind::Audio, "mp4a");
        track.samples = vec![sample(0, 1024), sample(1024, 1024)];
        assert_eq!(track.effective_duration(), 2048);

        track.duration = 5000;
        assert_eq!(track.effective_duration(), 5000);
    }

    #[test]
    fn test_ticks_to_ns() {
        let mut track = Track::new(0, 1, TrackKind::Audio, "A_OPUS");
        track.timescale = 48000;
        assert_eq!(track.ticks_to_ns(48000), 1_000_000_000);
        assert_eq!(track.ticks_to_ns(960), 20_000_000);
    }

    #[test]
    fn test_find_track() {
        let tracks = vec![
            Track::new(0, 1, TrackKind::Video, "V_VP9"),
            Track::new(0, 2, TrackKind::Audio, "A_OPUS"),
        ];
        assert_eq!(find_track(&tracks, TrackKind::Audio), Some(1));
        assert_eq!(find_track(&tracks, TrackKind::Subtitle), None);
    }

    #[test]
    fn test_select_tracks() {
        let first = vec![
            Track::new(0, 1, TrackKind::Video, "V_MJPEG"),
            Track::new(0, 2, TrackKind::Audio, "A_OPUS"),
        ];
        let second = vec![Track::new(1, 1, TrackKind::Audio, "A_VORBIS")];
        let per_source = vec![first, second];

        let selected = select_tracks(&per_source, &[1, 0]).unwrap();
        assert_eq!(selected[0].codec_id, "A_OPUS");
        assert_eq!(selected[1].codec_id, "A_VORBIS");

        assert!(select_tracks(&per_source, &[2, 0]).is_err());
        assert!(select_tracks(&per_source, &[0]).is_err());
    }
}
