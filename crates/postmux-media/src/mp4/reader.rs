//! MP4 box reader over a [`SeekableSource`].
//!
//! Handles both monolithic files (samples described by `moov/trak/.../stbl`)
//! and DASH-style fragmented files (`moov/mvex` defaults plus `moof`+`mdat`
//! pairs). Both layouts end up as plain [`Track`] sample lists with absolute
//! source offsets.

use super::atoms::unpack_language;
use super::{Atom, AtomType, HandlerType, Mp4File, SampleTableBuilder};
use crate::stream::SeekableSource;
use crate::track::{AudioParams, Sample, Track, TrackKind, VideoParams};
use crate::{Error, Result};
use bytes::Buf;
use std::collections::HashMap;

/// Maximum allowed atom data size (64 MB) to prevent OOM on malformed files.
const MAX_ATOM_DATA_SIZE: u64 = 64 * 1024 * 1024;

// tfhd flags
const TFHD_BASE_DATA_OFFSET: u32 = 0x01;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x02;
const TFHD_DEFAULT_DURATION: u32 = 0x08;
const TFHD_DEFAULT_SIZE: u32 = 0x10;
const TFHD_DEFAULT_FLAGS: u32 = 0x20;

// trun flags
const TRUN_DATA_OFFSET: u32 = 0x01;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x04;
const TRUN_SAMPLE_DURATION: u32 = 0x100;
const TRUN_SAMPLE_SIZE: u32 = 0x200;
const TRUN_SAMPLE_FLAGS: u32 = 0x400;
const TRUN_SAMPLE_CTS: u32 = 0x800;

/// sample_is_non_sync_sample bit of the sample flags.
const SAMPLE_NON_SYNC: u32 = 0x0001_0000;

/// Defaults from `mvex/trex`.
#[derive(Debug, Clone, Copy, Default)]
struct TrexDefaults {
    duration: u32,
    size: u32,
    flags: u32,
}

/// Resolved `tfhd` state for one track fragment.
#[derive(Debug, Clone, Copy)]
struct FragmentHeader {
    track_id: u32,
    base_offset: u64,
    duration: u32,
    size: u32,
    flags: u32,
}

/// Track fields gathered while walking a `trak`.
#[derive(Default)]
struct TrakState {
    track_id: u32,
    width: u32,
    height: u32,
    handler: Option<HandlerType>,
    timescale: u32,
    duration: u64,
    language: Option<String>,
    media_time: i64,
    sample_entry: Option<Vec<u8>>,
    table: SampleTableBuilder,
}

/// MP4 reader.
pub struct Mp4Reader<'a, S: ?Sized> {
    source: &'a mut S,
    source_index: usize,
    length: u64,
}

impl<'a, S: SeekableSource + ?Sized> Mp4Reader<'a, S> {
    /// Create a reader; `source_index` is recorded in every produced track.
    pub fn new(source: &'a mut S, source_index: usize) -> Self {
        let length = source.length();
        Self {
            source,
            source_index,
            length,
        }
    }

    /// Parse the whole box tree and rewind the source.
    pub fn parse(&mut self) -> Result<Mp4File> {
        self.check_signature()?;

        let mut mp4 = Mp4File {
            major_brand: [0; 4],
            minor_version: 0,
            compatible_brands: Vec::new(),
            timescale: 1000,
            duration: 0,
            tracks: Vec::new(),
            fragment_count: 0,
            has_faststart: false,
        };

        let mut trex = HashMap::new();
        let mut moov_offset = None;
        let mut mdat_offset = None;

        let atoms = self.read_atoms(0, self.length)?;
        for atom in &atoms {
            match atom.atom_type {
                AtomType::FTYP => self.parse_ftyp(atom, &mut mp4)?,
                AtomType::MOOV => {
                    moov_offset = Some(atom.start());
                    self.parse_moov(atom, &mut mp4, &mut trex)?;
                }
                AtomType::MOOF => {
                    if moov_offset.is_none() {
                        return Err(Error::malformed("moof box before moov"));
                    }
                    self.parse_moof(atom, &mut mp4, &trex)?;
                    mp4.fragment_count += 1;
                }
                AtomType::MDAT => {
                    mdat_offset.get_or_insert(atom.start());
                }
                other => tracing::trace!("Skipping top-level {} box", other),
            }
        }

        let moov_offset = moov_offset.ok_or_else(|| Error::malformed("missing moov box"))?;
        // Faststart means moov comes before mdat
        mp4.has_faststart = mdat_offset.map_or(true, |mdat| moov_offset < mdat);

        for track in &mp4.tracks {
            self.validate_samples(track)?;
        }

        tracing::debug!(
            "Parsed MP4 ({}) with {} tracks and {} fragments",
            mp4.brand_str(),
            mp4.tracks.len(),
            mp4.fragment_count
        );

        self.source.rewind()?;
        Ok(mp4)
    }

    fn check_signature(&mut self) -> Result<()> {
        if self.length < 8 {
            return Err(Error::unsupported("source too short for an ISO-BMFF file"));
        }
        self.source.seek_to(0)?;
        let mut header = [0u8; 8];
        self.source.read_fully(&mut header)?;
        match &header[4..8] {
            b"ftyp" | b"styp" => Ok(()),
            other => Err(Error::unsupported(format!(
                "not an ISO-BMFF file (first box {:?})",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn validate_samples(&self, track: &Track) -> Result<()> {
        if let Some(sample) = track.samples.iter().find(|s| s.end() > self.length) {
            return Err(Error::malformed(format!(
                "track {} sample at {}+{} exceeds the source length {}",
                track.id, sample.offset, sample.size, self.length
            )));
        }
        Ok(())
    }

    /// Read atoms at the given level.
    fn read_atoms(&mut self, start: u64, end: u64) -> Result<Vec<Atom>> {
        let mut atoms = Vec::new();
        let mut pos = start;

        while pos < end {
            if end - pos < 8 {
                return Err(Error::malformed(format!("truncated box header at {}", pos)));
            }
            self.source.seek_to(pos)?;

            let mut header = [0u8; 8];
            self.source.read_fully(&mut header)?;

            let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
            let atom_type = AtomType::from_bytes([header[4], header[5], header[6], header[7]]);

            let (actual_size, header_size) = if size == 1 {
                // 64-bit extended size
                let mut ext = [0u8; 8];
                self.source.read_fully(&mut ext)?;
                (u64::from_be_bytes(ext), 16u8)
            } else if size == 0 {
                // Atom extends to the end of its parent
                (end - pos, 8u8)
            } else {
                (size, 8u8)
            };

            if actual_size < header_size as u64 {
                return Err(Error::malformed(format!(
                    "{} box at {} has invalid size {}",
                    atom_type, pos, actual_size
                )));
            }
            if actual_size > end - pos {
                return Err(Error::malformed(format!(
                    "{} box at {} ({} bytes) overruns its parent ending at {}",
                    atom_type, pos, actual_size, end
                )));
            }

            tracing::trace!("{} box at {} ({} bytes)", atom_type, pos, actual_size);
            atoms.push(Atom {
                atom_type,
                size: actual_size,
                data_offset: pos + header_size as u64,
                header_size,
            });

            pos += actual_size;
        }

        Ok(atoms)
    }

    fn read_children(&mut self, parent: &Atom) -> Result<Vec<Atom>> {
        self.read_atoms(parent.data_offset, parent.end())
    }

    /// Read and validate atom data, rejecting oversized atoms.
    fn read_atom_data(&mut self, atom: &Atom) -> Result<Vec<u8>> {
        let size = atom.data_size();
        if size > MAX_ATOM_DATA_SIZE {
            return Err(Error::malformed(format!(
                "{} box data size {} exceeds maximum {}",
                atom.atom_type, size, MAX_ATOM_DATA_SIZE
            )));
        }
        self.source.seek_to(atom.data_offset)?;
        self.source.read_vec(size as usize)
    }

    fn parse_ftyp(&mut self, atom: &Atom, mp4: &mut Mp4File) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let mut buf = &data[..];
        ensure(buf, 8, atom)?;

        buf.copy_to_slice(&mut mp4.major_brand);
        mp4.minor_version = buf.get_u32();
        while buf.remaining() >= 4 {
            let mut brand = [0u8; 4];
            buf.copy_to_slice(&mut brand);
            mp4.compatible_brands.push(brand);
        }
        Ok(())
    }

    /// Parse moov atom.
    fn parse_moov(
        &mut self,
        moov: &Atom,
        mp4: &mut Mp4File,
        trex: &mut HashMap<u32, TrexDefaults>,
    ) -> Result<()> {
        for child in &self.read_children(moov)? {
            match child.atom_type {
                AtomType::MVHD => self.parse_mvhd(child, mp4)?,
                AtomType::TRAK => {
                    let track = self.parse_trak(child)?;
                    mp4.tracks.push(track);
                }
                AtomType::MVEX => {
                    for entry in &self.read_children(child)? {
                        if entry.atom_type == AtomType::TREX {
                            let (track_id, defaults) = self.parse_trex(entry)?;
                            trex.insert(track_id, defaults);
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Parse mvhd (movie header).
    fn parse_mvhd(&mut self, atom: &Atom, mp4: &mut Mp4File) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let mut buf = &data[..];
        ensure(buf, 4, atom)?;
        let version = buf.get_u8();
        buf.advance(3);

        if version == 0 {
            // 32-bit timestamps
            ensure(buf, 16, atom)?;
            buf.advance(8);
            mp4.timescale = buf.get_u32();
            mp4.duration = buf.get_u32() as u64;
        } else {
            ensure(buf, 28, atom)?;
            buf.advance(16);
            mp4.timescale = buf.get_u32();
            mp4.duration = buf.get_u64();
        }

        Ok(())
    }

    fn parse_trex(&mut self, atom: &Atom) -> Result<(u32, TrexDefaults)> {
        let data = self.read_atom_data(atom)?;
        let mut buf = &data[..];
        ensure(buf, 24, atom)?;
        buf.advance(4); // version/flags
        let track_id = buf.get_u32();
        buf.advance(4); // default sample description index
        let defaults = TrexDefaults {
            duration: buf.get_u32(),
            size: buf.get_u32(),
            flags: buf.get_u32(),
        };
        Ok((track_id, defaults))
    }

    /// Parse trak (track) atom.
    fn parse_trak(&mut self, trak: &Atom) -> Result<Track> {
        let mut state = TrakState::default();

        for child in &self.read_children(trak)? {
            match child.atom_type {
                AtomType::TKHD => self.parse_tkhd(child, &mut state)?,
                AtomType::EDTS => {
                    for entry in &self.read_children(child)? {
                        if entry.atom_type == AtomType::ELST {
                            self.parse_elst(entry, &mut state)?;
                        }
                    }
                }
                AtomType::MDIA => self.parse_mdia(child, &mut state)?,
                _ => {}
            }
        }

        self.finish_trak(state)
    }

    fn finish_trak(&self, state: TrakState) -> Result<Track> {
        let entry = state.sample_entry.ok_or_else(|| {
            Error::malformed(format!("track {} has no sample description", state.track_id))
        })?;
        if state.timescale == 0 {
            return Err(Error::malformed(format!(
                "track {} has a zero timescale",
                state.track_id
            )));
        }

        let kind = state
            .handler
            .map(|handler| handler.track_kind())
            .unwrap_or(TrackKind::Other);
        let codec_id = String::from_utf8_lossy(&entry[4..8]).into_owned();

        let mut track = Track::new(self.source_index, state.track_id as u64, kind, codec_id);
        track.timescale = state.timescale;
        track.duration = state.duration;
        track.language = state.language;
        track.media_time = state.media_time;

        match kind {
            // VisualSampleEntry: width/height at 32..36
            TrackKind::Video => {
                let (width, height) = if entry.len() >= 36 {
                    (
                        u16::from_be_bytes([entry[32], entry[33]]) as u32,
                        u16::from_be_bytes([entry[34], entry[35]]) as u32,
                    )
                } else {
                    (state.width, state.height)
                };
                track.video = Some(VideoParams { width, height });
            }
            // AudioSampleEntry: channels 24..26, sample size 26..28, rate 16.16 at 32..36
            TrackKind::Audio if entry.len() >= 36 => {
                track.audio = Some(AudioParams {
                    channels: u16::from_be_bytes([entry[24], entry[25]]),
                    bit_depth: u16::from_be_bytes([entry[26], entry[27]]),
                    sample_rate: (u32::from_be_bytes([entry[32], entry[33], entry[34], entry[35]])
                        >> 16) as f64,
                });
            }
            _ => {}
        }

        track.codec_config = entry;
        track.samples = state.table.build();
        tracing::debug!(
            "Track {} ({}, {}): {} samples, timescale {}",
            track.id,
            track.kind,
            track.codec_id,
            track.samples.len(),
            track.timescale
        );
        Ok(track)
    }

    /// Parse tkhd (track header).
    fn parse_tkhd(&mut self, atom: &Atom, state: &mut TrakState) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let mut buf = &data[..];
        ensure(buf, 4, atom)?;
        let version = buf.get_u8();
        buf.advance(3);

        // creation/modification times precede the track id
        let (times, tail) = if version == 0 { (8, 60) } else { (16, 64) };
        ensure(buf, times + 4, atom)?;
        buf.advance(times);
        state.track_id = buf.get_u32();

        // reserved + duration + reserved + layer/group/volume + matrix, then 16.16 width/height
        if buf.remaining() >= tail + 8 {
            buf.advance(tail);
            state.width = buf.get_u32() >> 16;
            state.height = buf.get_u32() >> 16;
        }

        Ok(())
    }

    fn parse_elst(&mut self, atom: &Atom, state: &mut TrakState) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let mut buf = &data[..];
        ensure(buf, 8, atom)?;
        let version = buf.get_u8();
        buf.advance(3);
        let count = buf.get_u32();
        let entry_size = if version == 1 { 20 } else { 12 };
        ensure_entries(buf, count, entry_size, atom)?;

        for _ in 0..count {
            let media_time = if version == 1 {
                buf.advance(8);
                buf.get_i64()
            } else {
                buf.advance(4);
                buf.get_i32() as i64
            };
            buf.advance(4); // media rate

            // -1 marks an empty edit
            if media_time >= 0 {
                state.media_time = media_time;
                break;
            }
        }

        Ok(())
    }

    /// Parse mdia (media) atom.
    fn parse_mdia(&mut self, mdia: &Atom, state: &mut TrakState) -> Result<()> {
        for child in &self.read_children(mdia)? {
            match child.atom_type {
                AtomType::MDHD => self.parse_mdhd(child, state)?,
                AtomType::HDLR => self.parse_hdlr(child, state)?,
                AtomType::MINF => {
                    for entry in &self.read_children(child)? {
                        if entry.atom_type == AtomType::STBL {
                            self.parse_stbl(entry, state)?;
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Parse mdhd (media header).
    fn parse_mdhd(&mut self, atom: &Atom, state: &mut TrakState) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let mut buf = &data[..];
        ensure(buf, 4, atom)?;
        let version = buf.get_u8();
        buf.advance(3);

        if version == 0 {
            ensure(buf, 18, atom)?;
            buf.advance(8);
            state.timescale = buf.get_u32();
            state.duration = buf.get_u32() as u64;
        } else {
            ensure(buf, 30, atom)?;
            buf.advance(16);
            state.timescale = buf.get_u32();
            state.duration = buf.get_u64();
        }
        state.language = unpack_language(buf.get_u16());

        Ok(())
    }

    /// Parse hdlr (handler) atom.
    fn parse_hdlr(&mut self, atom: &Atom, state: &mut TrakState) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        ensure(&data, 12, atom)?;
        state.handler = Some(HandlerType::from_bytes([data[8], data[9], data[10], data[11]]));
        Ok(())
    }

    /// Parse stbl (sample table) atom.
    fn parse_stbl(&mut self, stbl: &Atom, state: &mut TrakState) -> Result<()> {
        for child in &self.read_children(stbl)? {
            match child.atom_type {
                AtomType::STSD => self.parse_stsd(child, state)?,
                AtomType::STTS => {
                    let data = self.read_atom_data(child)?;
                    let entries = read_table(&data, child, 8, |buf| (buf.get_u32(), buf.get_u32()))?;
                    state.table.set_stts(entries);
                }
                AtomType::STSS => {
                    let data = self.read_atom_data(child)?;
                    let entries = read_table(&data, child, 4, |buf| buf.get_u32())?;
                    state.table.set_sync_samples(entries);
                }
                AtomType::STSC => {
                    let data = self.read_atom_data(child)?;
                    let entries = read_table(&data, child, 12, |buf| {
                        (buf.get_u32(), buf.get_u32(), buf.get_u32())
                    })?;
                    state.table.set_stsc(entries);
                }
                AtomType::STSZ => self.parse_stsz(child, state)?,
                AtomType::STCO => {
                    let data = self.read_atom_data(child)?;
                    let entries = read_table(&data, child, 4, |buf| buf.get_u32() as u64)?;
                    state.table.set_chunk_offsets(entries);
                }
                AtomType::CO64 => {
                    let data = self.read_atom_data(child)?;
                    let entries = read_table(&data, child, 8, |buf| buf.get_u64())?;
                    state.table.set_chunk_offsets(entries);
                }
                AtomType::CTTS => {
                    let data = self.read_atom_data(child)?;
                    // version 0 offsets are unsigned on paper, signed in practice
                    let entries =
                        read_table(&data, child, 8, |buf| (buf.get_u32(), buf.get_i32()))?;
                    state.table.set_ctts(entries);
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Parse stsz (sample size).
    fn parse_stsz(&mut self, atom: &Atom, state: &mut TrakState) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let mut buf = &data[..];
        ensure(buf, 12, atom)?;
        buf.advance(4); // version/flags

        let uniform_size = buf.get_u32();
        let sample_count = buf.get_u32();
        let sizes = if uniform_size == 0 {
            ensure_entries(buf, sample_count, 4, atom)?;
            (0..sample_count).map(|_| buf.get_u32()).collect()
        } else {
            ensure_payload_fits(sample_count, uniform_size, self.length, atom)?;
            Vec::new()
        };

        state.table.set_stsz(uniform_size, sample_count, sizes);
        Ok(())
    }

    /// Parse stsd (sample description), keeping the first entry box verbatim.
    fn parse_stsd(&mut self, atom: &Atom, state: &mut TrakState) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        ensure(&data, 16, atom)?;

        let entry_count = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if entry_count == 0 {
            return Err(Error::malformed("stsd box without sample entries"));
        }
        if entry_count > 1 {
            tracing::warn!("stsd has {} entries, only the first is kept", entry_count);
        }

        let entry_size = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
        if entry_size < 8 || 8 + entry_size > data.len() {
            return Err(Error::malformed(format!(
                "sample entry size {} does not fit the stsd box",
                entry_size
            )));
        }

        state.sample_entry = Some(data[8..8 + entry_size].to_vec());
        Ok(())
    }

    /// Parse a moof atom and append its samples to the known tracks.
    fn parse_moof(
        &mut self,
        moof: &Atom,
        mp4: &mut Mp4File,
        trex: &HashMap<u32, TrexDefaults>,
    ) -> Result<()> {
        for child in &self.read_children(moof)? {
            if child.atom_type == AtomType::TRAF {
                self.parse_traf(child, moof.start(), mp4, trex)?;
            }
        }
        Ok(())
    }

    fn parse_traf(
        &mut self,
        traf: &Atom,
        moof_start: u64,
        mp4: &mut Mp4File,
        trex: &HashMap<u32, TrexDefaults>,
    ) -> Result<()> {
        let mut header = None;
        let mut base_time = None;
        let mut data_cursor = None;

        for child in &self.read_children(traf)? {
            match child.atom_type {
                AtomType::TFHD => header = Some(self.parse_tfhd(child, moof_start, trex)?),
                AtomType::TFDT => base_time = Some(self.parse_tfdt(child)?),
                AtomType::TRUN => {
                    let header: FragmentHeader =
                        header.ok_or_else(|| Error::malformed("trun box before tfhd"))?;
                    let Some(index) = mp4.track_index(header.track_id as u64) else {
                        tracing::warn!("Fragment for unknown track {} ignored", header.track_id);
                        continue;
                    };
                    let samples = &mut mp4.tracks[index].samples;
                    let mut dts = base_time.take().unwrap_or_else(|| {
                        samples
                            .last()
                            .map_or(0, |s| s.timestamp + s.duration as u64)
                    });
                    let data = self.read_atom_data(child)?;
                    let end = parse_trun(&data, child, &header, data_cursor, self.length, &mut dts, samples)?;
                    data_cursor = Some(end);
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn parse_tfhd(
        &mut self,
        atom: &Atom,
        moof_start: u64,
        trex: &HashMap<u32, TrexDefaults>,
    ) -> Result<FragmentHeader> {
        let data = self.read_atom_data(atom)?;
        let mut buf = &data[..];
        ensure(buf, 8, atom)?;
        let flags = buf.get_u32() & 0x00FF_FFFF;
        let track_id = buf.get_u32();

        let defaults = trex.get(&track_id).copied().unwrap_or_default();
        let mut header = FragmentHeader {
            track_id,
            base_offset: moof_start,
            duration: defaults.duration,
            size: defaults.size,
            flags: defaults.flags,
        };

        if flags & TFHD_BASE_DATA_OFFSET != 0 {
            ensure(buf, 8, atom)?;
            header.base_offset = buf.get_u64();
        }
        if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
            ensure(buf, 4, atom)?;
            buf.advance(4);
        }
        if flags & TFHD_DEFAULT_DURATION != 0 {
            ensure(buf, 4, atom)?;
            header.duration = buf.get_u32();
        }
        if flags & TFHD_DEFAULT_SIZE != 0 {
            ensure(buf, 4, atom)?;
            header.size = buf.get_u32();
        }
        if flags & TFHD_DEFAULT_FLAGS != 0 {
            ensure(buf, 4, atom)?;
            header.flags = buf.get_u32();
        }

        Ok(header)
    }

    fn parse_tfdt(&mut self, atom: &Atom) -> Result<u64> {
        let data = self.read_atom_data(atom)?;
        let mut buf = &data[..];
        ensure(buf, 8, atom)?;
        let version = buf.get_u8();
        buf.advance(3);
        if version == 1 {
            ensure(buf, 8, atom)?;
            Ok(buf.get_u64())
        } else {
            Ok(buf.get_u32() as u64)
        }
    }
}

/// Parse one trun, appending samples. Returns the offset just past its data.
fn parse_trun(
    data: &[u8],
    atom: &Atom,
    header: &FragmentHeader,
    cursor: Option<u64>,
    length: u64,
    dts: &mut u64,
    samples: &mut Vec<Sample>,
) -> Result<u64> {
    let mut buf = data;
    ensure(buf, 8, atom)?;
    let version_flags = buf.get_u32();
    let version = (version_flags >> 24) as u8;
    let flags = version_flags & 0x00FF_FFFF;
    let count = buf.get_u32();

    let mut offset = cursor.unwrap_or(header.base_offset);
    if flags & TRUN_DATA_OFFSET != 0 {
        ensure(buf, 4, atom)?;
        let relative = buf.get_i32() as i64;
        offset = u64::try_from(header.base_offset as i64 + relative)
            .map_err(|_| Error::malformed("trun data offset before the start of the file"))?;
    }
    let first_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        ensure(buf, 4, atom)?;
        Some(buf.get_u32())
    } else {
        None
    };

    let fields = [
        TRUN_SAMPLE_DURATION,
        TRUN_SAMPLE_SIZE,
        TRUN_SAMPLE_FLAGS,
        TRUN_SAMPLE_CTS,
    ]
    .iter()
    .filter(|&&field| flags & field != 0)
    .count();
    ensure_entries(buf, count, fields * 4, atom)?;
    if flags & TRUN_SAMPLE_SIZE == 0 {
        ensure_payload_fits(count, header.size, length, atom)?;
    }

    samples.reserve(count as usize);
    for i in 0..count {
        let duration = if flags & TRUN_SAMPLE_DURATION != 0 {
            buf.get_u32()
        } else {
            header.duration
        };
        let size = if flags & TRUN_SAMPLE_SIZE != 0 {
            buf.get_u32()
        } else {
            header.size
        };
        let sample_flags = if flags & TRUN_SAMPLE_FLAGS != 0 {
            buf.get_u32()
        } else {
            match first_flags {
                Some(first) if i == 0 => first,
                _ => header.flags,
            }
        };
        let composition_offset = if flags & TRUN_SAMPLE_CTS != 0 {
            if version == 0 {
                buf.get_u32() as i32
            } else {
                buf.get_i32()
            }
        } else {
            0
        };

        if size > 0 {
            samples.push(Sample {
                offset,
                size,
                timestamp: *dts,
                duration,
                composition_offset,
                keyframe: sample_flags & SAMPLE_NON_SYNC == 0,
            });
        } else {
            tracing::trace!("Dropping empty sample in track {}", header.track_id);
        }

        offset += size as u64;
        *dts += duration as u64;
    }

    Ok(offset)
}

/// Decode a full-box table of `entry_size`-byte entries preceded by a count.
fn read_table<T>(
    data: &[u8],
    atom: &Atom,
    entry_size: usize,
    mut read: impl FnMut(&mut &[u8]) -> T,
) -> Result<Vec<T>> {
    let mut buf = data;
    ensure(buf, 8, atom)?;
    buf.advance(4); // version/flags
    let count = buf.get_u32();
    ensure_entries(buf, count, entry_size, atom)?;
    Ok((0..count).map(|_| read(&mut buf)).collect())
}

fn ensure(buf: &[u8], need: usize, atom: &Atom) -> Result<()> {
    if buf.len() < need {
        return Err(Error::malformed(format!(
            "{} box too short: need {} bytes, have {}",
            atom.atom_type,
            need,
            buf.len()
        )));
    }
    Ok(())
}

/// Samples of a default size must fit in the file; a zero size counts as one byte.
fn ensure_payload_fits(count: u32, size: u32, length: u64, atom: &Atom) -> Result<()> {
    let need = count as u64 * size.max(1) as u64;
    if need > length {
        return Err(Error::malformed(format!(
            "{} box declares {} samples of {} bytes in a {} byte file",
            atom.atom_type, count, size, length
        )));
    }
    Ok(())
}

fn ensure_entries(buf: &[u8], count: u32, entry_size: usize, atom: &Atom) -> Result<()> {
    let need = (count as u64).saturating_mul(entry_size as u64);
    if need > buf.len() as u64 {
        return Err(Error::malformed(format!(
            "{} box declares {} entries but holds {} bytes",
            atom.atom_type,
            count,
            buf.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::{DashWriter, Mp4Writer, Mp4WriterOptions};
    use crate::stream::MemorySource;
    use assert_matches::assert_matches;

    fn aac_track(samples: usize) -> Track {
        let mut track = Track::new(0, 1, TrackKind::Audio, "mp4a");
        track.timescale = 44100;
        track.codec_config = crate::mp4::tests::audio_entry();
        track.samples = (0..samples)
            .map(|i| Sample {
                offset: (i * 10) as u64,
                size: 10,
                timestamp: i as u64 * 1024,
                duration: 1024,
                composition_offset: 0,
                keyframe: true,
            })
            .collect();
        track
    }

    fn source_for(track: &Track) -> MemorySource {
        MemorySource::new(
            (0..track.samples.len() * 10)
                .map(|i| (i % 7) as u8)
                .collect::<Vec<u8>>(),
        )
    }

    #[test]
    fn test_parse_fragmented_output() {
        let track = aac_track(100);
        let mut sources = vec![source_for(&track)];
        let mut out = Vec::new();
        DashWriter::new(vec![track.clone()])
            .unwrap()
            .write(&mut sources, &mut out)
            .unwrap();

        let mut source = MemorySource::new(out);
        let mp4 = Mp4Reader::new(&mut source, 0).parse().unwrap();

        assert!(mp4.is_dash());
        assert!(mp4.fragment_count > 1);
        assert_eq!(mp4.tracks.len(), 1);
        let parsed = &mp4.tracks[0];
        assert_eq!(parsed.kind, TrackKind::Audio);
        assert_eq!(parsed.codec_id, "mp4a");
        assert_eq!(parsed.codec_config, track.codec_config);
        assert_eq!(parsed.samples.len(), 100);
        assert_eq!(parsed.samples[99].timestamp, 99 * 1024);
        assert_eq!(source.position(), 0);
    }

    #[test]
    fn test_parse_monolithic_output() {
        let track = aac_track(20);
        let mut sources = vec![source_for(&track)];
        let mut out = Vec::new();
        Mp4Writer::new(vec![track], Mp4WriterOptions::default())
            .unwrap()
            .write(&mut sources, &mut out)
            .unwrap();

        let mut source = MemorySource::new(out);
        let mp4 = Mp4Reader::new(&mut source, 0).parse().unwrap();
        assert!(!mp4.is_dash());
        assert!(mp4.has_faststart);
        assert_eq!(mp4.fragment_count, 0);
        assert_eq!(mp4.tracks[0].samples.len(), 20);
        assert_eq!(mp4.tracks[0].audio.map(|a| a.channels), Some(2));
    }

    #[test]
    fn test_truncated_box_is_malformed() {
        let track = aac_track(10);
        let mut sources = vec![source_for(&track)];
        let mut out = Vec::new();
        Mp4Writer::new(vec![track], Mp4WriterOptions::default())
            .unwrap()
            .write(&mut sources, &mut out)
            .unwrap();
        out.truncate(out.len() - 5);

        let mut source = MemorySource::new(out);
        assert_matches!(
            Mp4Reader::new(&mut source, 0).parse(),
            Err(Error::MalformedContainer(_))
        );
    }

    #[test]
    fn test_uniform_sample_count_beyond_file_is_malformed() {
        let track = aac_track(10);
        let mut sources = vec![source_for(&track)];
        let mut out = Vec::new();
        Mp4Writer::new(vec![track], Mp4WriterOptions::default())
            .unwrap()
            .write(&mut sources, &mut out)
            .unwrap();
        let stsz = out.windows(4).position(|w| w == b"stsz").unwrap();
        assert_eq!(&out[stsz + 8..stsz + 12], &10u32.to_be_bytes());
        out[stsz + 12..stsz + 16].copy_from_slice(&u32::MAX.to_be_bytes());

        let mut source = MemorySource::new(out);
        assert_matches!(
            Mp4Reader::new(&mut source, 0).parse(),
            Err(Error::MalformedContainer(_))
        );
    }

    #[test]
    fn test_trun_without_sample_fields_is_bounded() {
        let atom = Atom {
            atom_type: AtomType(*b"trun"),
            size: 16,
            data_offset: 0,
            header_size: 8,
        };
        let header = FragmentHeader {
            track_id: 1,
            base_offset: 0,
            duration: 1024,
            size: 0,
            flags: 0,
        };
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut dts = 0;
        let mut samples = Vec::new();
        assert_matches!(
            parse_trun(&data, &atom, &header, None, 4096, &mut dts, &mut samples),
            Err(Error::MalformedContainer(_))
        );
        assert!(samples.is_empty());

        data[4..8].copy_from_slice(&8u32.to_be_bytes());
        let header = FragmentHeader { size: 100, ..header };
        let end = parse_trun(&data, &atom, &header, None, 4096, &mut dts, &mut samples).unwrap();
        assert_eq!(samples.len(), 8);
        assert_eq!(end, 800);
        assert_eq!(dts, 8 * 1024);
    }

    #[test]
    fn test_random_bytes_are_unsupported() {
        let mut source = MemorySource::new(vec![0x42u8; 16]);
        assert_matches!(
            Mp4Reader::new(&mut source, 0).parse(),
            Err(Error::UnsupportedFormat(_))
        );

        let mut empty = MemorySource::new(Vec::new());
        assert_matches!(
            Mp4Reader::new(&mut empty, 0).parse(),
            Err(Error::UnsupportedFormat(_))
        );
    }
}
