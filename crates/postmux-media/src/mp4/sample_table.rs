//! MP4 sample table resolution.
//!
//! Sample tables describe how samples (frames) are organized in the file:
//! - stts: sample durations (decoding time)
//! - stss: sync sample table (keyframes)
//! - stsc: sample-to-chunk mapping
//! - stsz: sample sizes
//! - stco/co64: chunk offsets
//! - ctts: composition time offsets (for B-frames)

use crate::track::Sample;
use std::collections::HashSet;

/// Builder for resolving raw stbl tables into [`Sample`] descriptors.
#[derive(Debug, Default)]
pub struct SampleTableBuilder {
    // stts: (count, delta)
    stts_entries: Vec<(u32, u32)>,
    // stss: sync sample numbers (1-based), None when the box is absent
    sync_samples: Option<Vec<u32>>,
    // stsc: (first_chunk, samples_per_chunk, sample_description_index)
    stsc_entries: Vec<(u32, u32, u32)>,
    // stsz: if uniform_size > 0, all samples have that size
    uniform_size: u32,
    uniform_count: u32,
    sample_sizes: Vec<u32>,
    chunk_offsets: Vec<u64>,
    // ctts: (count, offset)
    ctts_entries: Vec<(u32, i32)>,
}

impl SampleTableBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set stts (decoding time to sample) entries.
    pub fn set_stts(&mut self, entries: Vec<(u32, u32)>) {
        self.stts_entries = entries;
    }

    /// Set stss (sync sample) entries.
    pub fn set_sync_samples(&mut self, samples: Vec<u32>) {
        self.sync_samples = Some(samples);
    }

    /// Set stsc (sample to chunk) entries.
    pub fn set_stsc(&mut self, entries: Vec<(u32, u32, u32)>) {
        self.stsc_entries = entries;
    }

    /// Set stsz (sample size) data.
    pub fn set_stsz(&mut self, uniform_size: u32, sample_count: u32, sizes: Vec<u32>) {
        self.uniform_size = uniform_size;
        self.uniform_count = sample_count;
        self.sample_sizes = sizes;
    }

    /// Set chunk offsets (from stco or co64).
    pub fn set_chunk_offsets(&mut self, offsets: Vec<u64>) {
        self.chunk_offsets = offsets;
    }

    /// Set ctts (composition time to sample) entries.
    pub fn set_ctts(&mut self, entries: Vec<(u32, i32)>) {
        self.ctts_entries = entries;
    }

    /// Number of samples described by stsz.
    pub fn sample_count(&self) -> u32 {
        if self.uniform_size > 0 {
            self.uniform_count
        } else {
            self.sample_sizes.len() as u32
        }
    }

    /// Resolve every sample's offset, size, timing and sync flag.
    pub fn build(self) -> Vec<Sample> {
        let sample_count = self.sample_count();
        if sample_count == 0 {
            return Vec::new();
        }

        let sample_chunks = self.resolve_sample_chunks(sample_count);
        let offsets = self.resolve_offsets(&sample_chunks, sample_count);
        let (dts_values, durations) = self.resolve_timestamps(sample_count);
        let cts_offsets = self.resolve_cts_offsets(sample_count);
        let sync_set: Option<HashSet<u32>> = self
            .sync_samples
            .as_ref()
            .map(|samples| samples.iter().copied().collect());

        (0..sample_count as usize)
            .map(|i| Sample {
                offset: offsets[i],
                size: self.size_of(i),
                timestamp: dts_values[i],
                duration: durations[i],
                composition_offset: cts_offsets[i],
                // No stss means all samples are sync samples
                keyframe: sync_set
                    .as_ref()
                    .map_or(true, |set| set.contains(&(i as u32 + 1))),
            })
            .collect()
    }

    fn size_of(&self, index: usize) -> u32 {
        if self.uniform_size > 0 {
            self.uniform_size
        } else {
            self.sample_sizes.get(index).copied().unwrap_or(0)
        }
    }

    fn resolve_sample_chunks(&self, sample_count: u32) -> Vec<u32> {
        if self.stsc_entries.is_empty() {
            return vec![0; sample_count as usize];
        }

        let mut result = Vec::with_capacity(sample_count as usize);
        let num_chunks = self.chunk_offsets.len() as u32;

        for (i, &(first_chunk, samples_per_chunk, _)) in self.stsc_entries.iter().enumerate() {
            let next_first = self
                .stsc_entries
                .get(i + 1)
                .map_or(num_chunks + 1, |entry| entry.0);

            for chunk in first_chunk.max(1)..next_first {
                if chunk > num_chunks {
                    break;
                }
                for _ in 0..samples_per_chunk {
                    if result.len() as u32 >= sample_count {
                        break;
                    }
                    result.push(chunk - 1);
                }
            }
        }

        while (result.len() as u32) < sample_count {
            result.push(result.last().copied().unwrap_or(0));
        }

        result
    }

    fn resolve_offsets(&self, sample_chunks: &[u32], sample_count: u32) -> Vec<u64> {
        let mut offsets = Vec::with_capacity(sample_count as usize);
        let mut chunk_sample_offset = vec![0u64; self.chunk_offsets.len()];

        for (i, &chunk) in sample_chunks.iter().enumerate() {
            let chunk_idx = chunk as usize;
            let chunk_base = self.chunk_offsets.get(chunk_idx).copied().unwrap_or(0);
            let within = chunk_sample_offset.get(chunk_idx).copied().unwrap_or(0);
            offsets.push(chunk_base + within);

            if let Some(within) = chunk_sample_offset.get_mut(chunk_idx) {
                *within += self.size_of(i) as u64;
            }
        }

        offsets
    }

    fn resolve_timestamps(&self, sample_count: u32) -> (Vec<u64>, Vec<u32>) {
        let mut dts_values = Vec::with_capacity(sample_count as usize);
        let mut durations = Vec::with_capacity(sample_count as usize);
        let mut current_dts = 0u64;

        'entries: for &(count, delta) in &self.stts_entries {
            for _ in 0..count {
                if dts_values.len() as u32 >= sample_count {
                    break 'entries;
                }
                dts_values.push(current_dts);
                durations.push(delta);
                current_dts += delta as u64;
            }
        }

        // Pad with last duration if needed
        let last_duration = durations.last().copied().unwrap_or(1);
        while (dts_values.len() as u32) < sample_count {
            dts_values.push(current_dts);
            durations.push(last_duration);
            current_dts += last_duration as u64;
        }

        (dts_values, durations)
    }

    fn resolve_cts_offsets(&self, sample_count: u32) -> Vec<i32> {
        let mut offsets = Vec::with_capacity(sample_count as usize);
        'entries: for &(count, offset) in &self.ctts_entries {
            for _ in 0..count {
                if offsets.len() >= sample_count as usize {
                    break 'entries;
                }
                offsets.push(offset);
            }
        }

        offsets.resize(sample_count as usize, 0);
        offsets
    }
}
