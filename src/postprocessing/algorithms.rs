//! Algorithm registry and the per-algorithm `test`/`process` implementations.

use postmux_media::mp4::{Mp4Brand, Mp4File, Mp4Writer, Mp4WriterOptions};
use postmux_media::ogg::{OggWriter, OGG_MAGIC};
use postmux_media::stream::{peek_signature, OutputSink, SeekableSource};
use postmux_media::subtitle::{self, ConvertOptions, SubtitleFormat};
use postmux_media::track::{find_track, select_tracks, Track, TrackKind};
use postmux_media::webm::{WebmFile, WebmWriter, EBML_MAGIC};
use postmux_media::{Error, Result};

pub const ALGORITHM_WEBM_MUXER: &str = "webm";
pub const ALGORITHM_MP4_FROM_DASH_MUXER: &str = "mp4D-mp4";
pub const ALGORITHM_M4A_NO_DASH: &str = "mp4D-m4a";
pub const ALGORITHM_TTML_CONVERTER: &str = "ttml";
pub const ALGORITHM_OGG_FROM_WEBM_DEMUXER: &str = "webm-ogg-d";

/// Available post-processing algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Merge WebM sources into one WebM file.
    WebmMuxer,
    /// Merge DASH video and audio into a moov-first MP4.
    Mp4FromDash,
    /// Rewrite a DASH audio download as a plain M4A.
    M4aNoDash,
    /// Convert TTML subtitles to SRT.
    TtmlConverter,
    /// Extract an Opus or Vorbis track from WebM into Ogg.
    OggFromWebm,
}

const REGISTRY: [(&str, Algorithm); 5] = [
    (ALGORITHM_WEBM_MUXER, Algorithm::WebmMuxer),
    (ALGORITHM_MP4_FROM_DASH_MUXER, Algorithm::Mp4FromDash),
    (ALGORITHM_M4A_NO_DASH, Algorithm::M4aNoDash),
    (ALGORITHM_TTML_CONVERTER, Algorithm::TtmlConverter),
    (ALGORITHM_OGG_FROM_WEBM_DEMUXER, Algorithm::OggFromWebm),
];

/// Tunables passed to every algorithm.
#[derive(Debug, Clone)]
pub struct AlgorithmOptions {
    /// Decode time per MP4 chunk.
    pub chunk_ms: u32,
}

impl Default for AlgorithmOptions {
    fn default() -> Self {
        Self { chunk_ms: 1000 }
    }
}

/// Positional string arguments of a mission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args(Vec<String>);

impl Args {
    pub fn new(args: Vec<String>) -> Self {
        Self(args)
    }

    /// Argument at `index`, or `default` when absent.
    pub fn get<'a>(&'a self, index: usize, default: &'a str) -> &'a str {
        self.0.get(index).map(String::as_str).unwrap_or(default)
    }

    /// Boolean argument; only `"true"` (any case) is true.
    pub fn flag(&self, index: usize, default: bool) -> bool {
        match self.0.get(index) {
            Some(value) => value.eq_ignore_ascii_case("true"),
            None => default,
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl Algorithm {
    /// Look up an algorithm by its registry name.
    pub fn from_name(name: &str) -> Option<Self> {
        REGISTRY
            .iter()
            .find(|(entry, _)| *entry == name)
            .map(|&(_, algorithm)| algorithm)
    }

    /// Every registered algorithm with its name.
    pub fn registry() -> &'static [(&'static str, Algorithm)] {
        &REGISTRY
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::WebmMuxer => ALGORITHM_WEBM_MUXER,
            Self::Mp4FromDash => ALGORITHM_MP4_FROM_DASH_MUXER,
            Self::M4aNoDash => ALGORITHM_M4A_NO_DASH,
            Self::TtmlConverter => ALGORITHM_TTML_CONVERTER,
            Self::OggFromWebm => ALGORITHM_OGG_FROM_WEBM_DEMUXER,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::WebmMuxer => "Merge WebM video and audio into one WebM file",
            Self::Mp4FromDash => "Merge DASH video and audio into a moov-first MP4",
            Self::M4aNoDash => "Rewrite a DASH audio download as M4A",
            Self::TtmlConverter => "Convert TTML subtitles to SRT",
            Self::OggFromWebm => "Extract Opus/Vorbis audio from WebM into Ogg",
        }
    }

    /// Whether `process` has to run.
    ///
    /// Returns `false` when the input already is in the target format and
    /// fails with [`Error::UnsupportedFormat`] when it is not recognized.
    pub fn test<S: SeekableSource>(self, args: &Args, sources: &mut [S]) -> Result<bool> {
        require_sources(self, sources, 1)?;
        let required = match self {
            Self::WebmMuxer => {
                for source in sources.iter_mut() {
                    expect_signature(source, "WebM", |magic| magic == EBML_MAGIC)?;
                }
                true
            }
            Self::Mp4FromDash => {
                for source in sources.iter_mut() {
                    mp4_major_brand(source)?;
                }
                true
            }
            Self::M4aNoDash => {
                let brand = mp4_major_brand(&mut sources[0])?;
                matches!(&brand, b"dash" | b"iso5")
            }
            Self::TtmlConverter => {
                args.get(0, "ttml").parse::<SubtitleFormat>()?;
                true
            }
            Self::OggFromWebm => {
                let source = &mut sources[0];
                match peek_signature(source)? {
                    Some(magic) if magic == OGG_MAGIC => false,
                    Some(magic) if magic == EBML_MAGIC => {
                        let file = WebmFile::parse(source, 0)?;
                        source.rewind()?;
                        if ogg_track(&file.tracks).is_none() {
                            return Err(Error::unsupported("WebM source has no Opus or Vorbis track"));
                        }
                        true
                    }
                    _ => return Err(Error::unsupported("source is neither WebM nor Ogg")),
                }
            }
        };
        tracing::debug!("Algorithm {} test: processing required = {}", self.name(), required);
        Ok(required)
    }

    /// Run the algorithm, writing into `out`. Returns the number of bytes written.
    pub fn process<S, O>(
        self,
        options: &AlgorithmOptions,
        args: &Args,
        sources: &mut [S],
        out: &mut O,
    ) -> Result<u64>
    where
        S: SeekableSource,
        O: OutputSink + ?Sized,
    {
        require_sources(self, sources, 1)?;
        match self {
            Self::WebmMuxer => {
                let per_source = sources
                    .iter_mut()
                    .enumerate()
                    .map(|(i, source)| WebmFile::parse(source, i).map(|file| file.tracks))
                    .collect::<Result<Vec<_>>>()?;
                let tracks = select_tracks(&per_source, &default_track_indexes(&per_source))?;
                WebmWriter::new(tracks)?.write(sources, out)
            }
            Self::Mp4FromDash => {
                let per_source = sources
                    .iter_mut()
                    .enumerate()
                    .map(|(i, source)| Mp4File::parse(source, i).map(|file| file.tracks))
                    .collect::<Result<Vec<_>>>()?;
                let tracks = select_tracks(&per_source, &default_track_indexes(&per_source))?;
                let writer_options = Mp4WriterOptions {
                    brand: Mp4Brand::Mp4,
                    chunk_ms: options.chunk_ms,
                };
                Mp4Writer::new(tracks, writer_options)?.write(sources, out)
            }
            Self::M4aNoDash => {
                let file = Mp4File::parse(&mut sources[0], 0)?;
                let track = file
                    .track(TrackKind::Audio)
                    .cloned()
                    .ok_or_else(|| Error::unsupported("no audio track in M4A source"))?;
                let writer_options = Mp4WriterOptions {
                    brand: Mp4Brand::M4a,
                    chunk_ms: options.chunk_ms,
                };
                Mp4Writer::new(vec![track], writer_options)?.write(&mut sources[..1], out)
            }
            Self::TtmlConverter => {
                let format: SubtitleFormat = args.get(0, "ttml").parse()?;
                let convert_options = ConvertOptions {
                    ignore_empty_frames: args.flag(1, true),
                    keep_formatting: args.flag(2, false),
                    honor_positioning: args.flag(3, false),
                    detect_duplicate_lines: args.flag(4, false),
                };
                subtitle::convert(format, &mut sources[0], out, &convert_options)
            }
            Self::OggFromWebm => {
                let file = WebmFile::parse(&mut sources[0], 0)?;
                let track = ogg_track(&file.tracks)
                    .cloned()
                    .ok_or_else(|| Error::unsupported("WebM source has no Opus or Vorbis track"))?;
                OggWriter::new(track)?.write(&mut sources[..1], out)
            }
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn require_sources<S>(algorithm: Algorithm, sources: &[S], min: usize) -> Result<()> {
    if sources.len() < min {
        return Err(Error::unsupported(format!(
            "{} needs at least {} source(s), got {}",
            algorithm,
            min,
            sources.len()
        )));
    }
    Ok(())
}

/// Track picked from each source when several sources are merged: the video
/// of the first source and the audio of every other one. A lone source keeps
/// its audio, which drops cover-art video tracks.
pub fn default_track_indexes(per_source: &[Vec<Track>]) -> Vec<usize> {
    let merging = per_source.len() > 1;
    per_source
        .iter()
        .enumerate()
        .map(|(i, tracks)| {
            let wanted = if merging && i == 0 {
                TrackKind::Video
            } else {
                TrackKind::Audio
            };
            find_track(tracks, wanted).unwrap_or(0)
        })
        .collect()
}

/// First audio track that Ogg can carry.
fn ogg_track(tracks: &[Track]) -> Option<&Track> {
    tracks
        .iter()
        .find(|t| t.kind.is_audio() && matches!(t.codec_id.as_str(), "A_OPUS" | "A_VORBIS"))
}

fn expect_signature<S: SeekableSource + ?Sized>(
    source: &mut S,
    format: &str,
    matches: impl Fn([u8; 4]) -> bool,
) -> Result<()> {
    match peek_signature(source)? {
        Some(magic) if matches(magic) => Ok(()),
        Some(magic) => Err(Error::unsupported(format!(
            "expected {}, found signature {:02X?}",
            format, magic
        ))),
        None => Err(Error::unsupported(format!(
            "expected {}, source holds {} bytes",
            format,
            source.length()
        ))),
    }
}

/// Major brand of an MP4 source that starts with `ftyp`. Rewinds the source.
fn mp4_major_brand<S: SeekableSource + ?Sized>(source: &mut S) -> Result<[u8; 4]> {
    source.rewind()?;
    if source.length() < 12 {
        return Err(Error::unsupported(format!(
            "expected MP4, source holds {} bytes",
            source.length()
        )));
    }
    let mut header = [0u8; 12];
    source.read_fully(&mut header)?;
    source.rewind()?;
    if &header[4..8] != b"ftyp" {
        return Err(Error::unsupported(format!(
            "expected MP4 ftyp box, found {:02X?}",
            &header[4..8]
        )));
    }
    Ok([header[8], header[9], header[10], header[11]])
}
