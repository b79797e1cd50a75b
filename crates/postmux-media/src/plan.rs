//! Interleaving plan shared by the muxers.
//!
//! A plan is the final output order of sample runs ("spans") across the
//! selected tracks. It is computed before anything is written, which also
//! tells for every source the lowest offset still needed after each span.
//! Those offsets are published through [`SeekableSource::release`] while
//! copying, so an in-place writer never overtakes data that is still to be
//! read, whatever order the tracks interleave in.

use crate::stream::SeekableSource;
use crate::track::Track;

/// A run of consecutive samples of one track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Index into the selected track list.
    pub track: usize,
    /// Index of the first sample in the track.
    pub first: usize,
    /// Number of samples.
    pub count: usize,
    /// Decode time of the first sample in nanoseconds.
    pub time_ns: u64,
}

/// Ordered spans plus per-source release offsets.
#[derive(Debug, Clone, Default)]
pub struct CopyPlan {
    spans: Vec<Span>,
    /// (source, offset) to release once the span at the same index is copied.
    releases: Vec<(usize, u64)>,
    /// Lowest offset needed from each source before copying starts.
    initial: Vec<u64>,
    /// Per span, the lowest offset its source still needs after each sample.
    floors: Vec<Vec<u64>>,
}

impl CopyPlan {
    /// Order `spans` by decode time (ties keep track order) and derive releases.
    pub fn new(tracks: &[&Track], mut spans: Vec<Span>, source_count: usize) -> Self {
        spans.sort_by_key(|span| (span.time_ns, span.track, span.first));

        let mut lowest = vec![u64::MAX; source_count];
        let mut releases = vec![(0usize, 0u64); spans.len()];
        let mut floors = vec![Vec::new(); spans.len()];
        for (i, span) in spans.iter().enumerate().rev() {
            let track = tracks[span.track];
            let mut running = lowest[track.source];
            releases[i] = (track.source, running);

            let samples = &track.samples[span.first..span.first + span.count];
            let mut span_floors = vec![0u64; samples.len()];
            for (k, sample) in samples.iter().enumerate().rev() {
                span_floors[k] = running;
                running = running.min(sample.offset);
            }
            floors[i] = span_floors;
            lowest[track.source] = running;
        }

        Self {
            spans,
            releases,
            initial: lowest,
            floors,
        }
    }

    /// One span per sample.
    pub fn per_sample(tracks: &[&Track], source_count: usize) -> Self {
        let spans = tracks
            .iter()
            .enumerate()
            .flat_map(|(t, track)| {
                track.samples.iter().enumerate().map(move |(i, s)| Span {
                    track: t,
                    first: i,
                    count: 1,
                    time_ns: track.ticks_to_ns(s.timestamp),
                })
            })
            .collect();
        Self::new(tracks, spans, source_count)
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Release everything before the first needed byte of every source.
    pub fn begin<S: SeekableSource>(&self, sources: &mut [S]) {
        for (source, offset) in sources.iter_mut().zip(&self.initial) {
            source.release(*offset);
        }
    }

    /// Lowest offset the source of span `index` still needs once its
    /// `sample`-th sample has been read.
    pub fn floor(&self, index: usize, sample: usize) -> u64 {
        self.floors
            .get(index)
            .and_then(|floors| floors.get(sample))
            .copied()
            .unwrap_or(0)
    }

    /// Publish the release offset due after span `index` was read.
    pub fn finish_span<S: SeekableSource>(&self, index: usize, sources: &mut [S]) {
        let (source, offset) = self.releases[index];
        if let Some(source) = sources.get_mut(source) {
            source.release(offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{copy_range_releasing, MemorySource};
    use crate::track::{Sample, TrackKind};

    fn track(source: usize, offsets: &[u64], step: u64) -> Track {
        let mut track = Track::new(source, 1, TrackKind::Audio, "test");
        track.timescale = 1000;
        track.samples = offsets
            .iter()
            .enumerate()
            .map(|(i, &offset)| Sample {
                offset,
                size: 10,
                timestamp: i as u64 * step,
                duration: step as u32,
                composition_offset: 0,
                keyframe: true,
            })
            .collect();
        track
    }

    #[test]
    fn test_order_by_time_then_track() {
        let video = track(0, &[100, 110, 120], 40);
        let audio = track(1, &[50, 60, 70], 20);
        let plan = CopyPlan::per_sample(&[&video, &audio], 2);

        let order: Vec<(usize, usize)> = plan.spans().iter().map(|s| (s.track, s.first)).collect();
        assert_eq!(order, vec![(0, 0), (1, 0), (1, 1), (0, 1), (1, 2), (0, 2)]);
    }

    #[test]
    fn test_release_marks_follow_remaining_samples() {
        // Two tracks of one source whose samples interleave in the file.
        let a = track(0, &[10, 40], 10);
        let b = track(0, &[20, 30], 10);
        let plan = CopyPlan::per_sample(&[&a, &b], 1);
        let mut sources = vec![MemorySource::new(vec![0u8; 64])];

        plan.begin(&mut sources);
        assert_eq!(sources[0].released(), 10);

        // order: a0 (t=0), b0 (t=0), a1 (t=10), b1 (t=10)
        plan.finish_span(0, &mut sources);
        assert_eq!(sources[0].released(), 20);
        plan.finish_span(1, &mut sources);
        assert_eq!(sources[0].released(), 30);
        plan.finish_span(2, &mut sources);
        assert_eq!(sources[0].released(), 30);
        plan.finish_span(3, &mut sources);
        assert_eq!(sources[0].released(), 64);
    }

    #[test]
    fn test_floors_follow_samples_within_span() {
        let a = track(0, &[10, 20, 30], 10);
        let b = track(0, &[25], 10);
        let spans = vec![
            Span {
                track: 0,
                first: 0,
                count: 3,
                time_ns: 0,
            },
            Span {
                track: 1,
                first: 0,
                count: 1,
                time_ns: 1,
            },
        ];
        let plan = CopyPlan::new(&[&a, &b], spans, 1);

        // b0 at 25 stays needed until the second span.
        assert_eq!(plan.floor(0, 0), 20);
        assert_eq!(plan.floor(0, 1), 25);
        assert_eq!(plan.floor(0, 2), 25);
        assert_eq!(plan.floor(1, 0), u64::MAX);
    }

    #[test]
    fn test_releasing_copy_publishes_read_position() {
        let a = track(0, &[0, 10, 20], 10);
        let plan = CopyPlan::new(
            &[&a],
            vec![Span {
                track: 0,
                first: 0,
                count: 3,
                time_ns: 0,
            }],
            1,
        );
        let mut source = MemorySource::new((0u8..30).collect::<Vec<_>>());
        let mut sink = Vec::new();
        let mut buffer = [0u8; 4];

        copy_range_releasing(&mut source, 0, 10, &mut sink, &mut buffer, plan.floor(0, 0)).unwrap();
        assert_eq!(source.released(), 10);
        copy_range_releasing(&mut source, 10, 20, &mut sink, &mut buffer, plan.floor(0, 2)).unwrap();
        assert_eq!(source.released(), 30);
        assert_eq!(sink, (0u8..30).collect::<Vec<_>>());
    }
}
