//! Mission execution: source wiring, output selection and cleanup.

use super::algorithms::{Algorithm, AlgorithmOptions, Args};
use super::error::{Error, Result};
use super::mission::{Mission, MissionHandle, MissionState, SourceSpec};
use crate::config::Config;
use postmux_media::stream::{
    ChunkFileSource, CircularFileWriter, CircularOptions, FileSink, OffsetChecker, ProgressTracker,
    SeekableSource, WriteFault,
};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Settings shared by every run.
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    /// Scratch directory for the circular writer; system temp when `None`.
    pub temp_dir: Option<PathBuf>,
    pub circular: CircularOptions,
    pub algorithm: AlgorithmOptions,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        let pp = &config.postprocessing;
        Self {
            temp_dir: pp.temp_dir.clone(),
            circular: CircularOptions {
                aux_threshold: pp.aux_threshold,
                stall_limit: pp.stall_limit,
                progress_interval: pp.progress_interval,
            },
            algorithm: AlgorithmOptions {
                chunk_ms: config.mp4.chunk_ms,
            },
        }
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// `test` found nothing to do; the input is untouched.
    Skipped,
    /// Output written with the given length.
    Completed { length: u64 },
}

/// Run `mission`, reporting state, progress and errors through `handle`.
pub fn run(mission: &Mission, settings: &RunSettings, handle: &MissionHandle) -> Result<RunOutcome> {
    let result = execute(mission, settings, handle);
    match &result {
        Ok(RunOutcome::Completed { length }) => {
            tracing::info!("Post-processing {} completed: {} bytes", mission.algorithm, length);
            handle.complete(*length);
        }
        Ok(RunOutcome::Skipped) => {
            tracing::info!("Post-processing {} skipped: nothing to do", mission.algorithm);
            handle.skip();
        }
        Err(err) => {
            tracing::warn!("Post-processing {} failed: {}", mission.algorithm, err);
            handle.fail(err.code(), err.to_string());
        }
    }
    result
}

fn execute(mission: &Mission, settings: &RunSettings, handle: &MissionHandle) -> Result<RunOutcome> {
    let algorithm = Algorithm::from_name(&mission.algorithm)
        .ok_or_else(|| Error::UnimplementedAlgorithm(mission.algorithm.clone()))?;
    if mission.sources.is_empty() {
        return Err(Error::InvalidMission("no sources".into()));
    }
    let args = Args::new(mission.args.clone());

    tracing::info!(
        "Running {} on {} source(s) -> {:?}{}",
        algorithm,
        mission.sources.len(),
        mission.output,
        if mission.same_file { " (same file)" } else { "" }
    );

    if mission.same_file {
        run_same_file(algorithm, &args, mission, settings, handle)
    } else {
        run_separate(algorithm, &args, mission, settings, handle)
    }
}

fn run_same_file(
    algorithm: Algorithm,
    args: &Args,
    mission: &Mission,
    settings: &RunSettings,
    handle: &MissionHandle,
) -> Result<RunOutcome> {
    let path = &mission.output;
    if let Some(spec) = mission.sources.iter().find(|s| &s.path != path) {
        return Err(Error::InvalidMission(format!(
            "same-file source {:?} is not the output {:?}",
            spec.path, path
        )));
    }
    if mission.sources.windows(2).any(|w| w[1].offset < w[0].offset) {
        return Err(Error::InvalidMission("source offsets are not ascending".into()));
    }

    handle.reset(fs::metadata(path)?.len());
    let mut sources = open_sources(&mission.sources)?;

    handle.set_state(MissionState::Testing);
    if !algorithm.test(args, &mut sources)? {
        dispose_all(&mut sources);
        return Ok(RunOutcome::Skipped);
    }
    for source in sources.iter_mut() {
        source.rewind()?;
    }

    let tracker = ProgressTracker::new(sources.iter().map(ChunkFileSource::progress).collect());
    let checker: OffsetChecker = Box::new(move || tracker.safe_offset());

    let target = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::file_creation(path, e))?;
    let scratch = scratch_file(settings.temp_dir.as_deref())?;

    let progress = handle.clone();
    let hold = handle.clone();
    let mut out = CircularFileWriter::new(target, scratch, checker)
        .with_options(settings.circular.clone())
        .with_progress(Box::new(move |done| progress.report_progress(done)))
        .with_write_error_handler(Box::new(move |fault| hold.hold(describe_fault(fault))));

    handle.set_state(MissionState::Processing);
    let processed = algorithm.process(&settings.algorithm, args, &mut sources, &mut out);
    dispose_all(&mut sources);

    let touched = out.committed() > 0 || out.pending() > 0;
    let finished = processed.and_then(|_| out.finalize());
    match finished {
        Ok(length) => Ok(RunOutcome::Completed { length }),
        Err(err) => {
            // Part of the original was overwritten, what is left cannot be resumed
            if touched {
                discard_damaged(path);
            }
            Err(err.into())
        }
    }
}

fn run_separate(
    algorithm: Algorithm,
    args: &Args,
    mission: &Mission,
    settings: &RunSettings,
    handle: &MissionHandle,
) -> Result<RunOutcome> {
    let mut sources = open_sources(&mission.sources)?;
    handle.reset(sources.iter().map(|s| s.length()).sum());

    handle.set_state(MissionState::Testing);
    if !algorithm.test(args, &mut sources)? {
        dispose_all(&mut sources);
        return Ok(RunOutcome::Skipped);
    }
    for source in sources.iter_mut() {
        source.rewind()?;
    }

    let parent = match mission.output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|source| Error::PathCreation {
        path: parent.clone(),
        source,
    })?;

    // Same directory as the output so persist() is a plain rename
    let temp = tempfile::Builder::new()
        .prefix(".postmux-")
        .suffix(".part")
        .tempfile_in(&parent)
        .map_err(|e| Error::file_creation(&parent, e))?;
    let file = temp
        .as_file()
        .try_clone()
        .map_err(|e| Error::file_creation(temp.path(), e))?;

    let progress = handle.clone();
    let mut out = FileSink::new(file).with_progress(
        settings.circular.progress_interval,
        Box::new(move |done| progress.report_progress(done)),
    );

    handle.set_state(MissionState::Processing);
    let processed = algorithm.process(&settings.algorithm, args, &mut sources, &mut out);
    dispose_all(&mut sources);
    processed?;
    let length = out.finish()?;

    temp.persist(&mission.output)
        .map_err(|e| Error::file_creation(&mission.output, e.error))?;
    Ok(RunOutcome::Completed { length })
}

/// Absolute window `[start, end)` of every source.
///
/// A source without a length runs up to the next source of the same file,
/// or to the end of the file.
pub fn source_windows(specs: &[SourceSpec]) -> Vec<(u64, Option<u64>)> {
    specs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let end = spec.length.map(|len| spec.offset + len).or_else(|| {
                specs
                    .get(i + 1)
                    .filter(|next| next.path == spec.path && next.offset >= spec.offset)
                    .map(|next| next.offset)
            });
            (spec.offset, end)
        })
        .collect()
}

fn open_sources(specs: &[SourceSpec]) -> Result<Vec<ChunkFileSource>> {
    specs
        .iter()
        .zip(source_windows(specs))
        .map(|(spec, (start, end))| {
            tracing::debug!("Source {:?} [{}, {:?})", spec.path, start, end);
            ChunkFileSource::open(&spec.path, start, end).map_err(Error::from)
        })
        .collect()
}

fn dispose_all(sources: &mut [ChunkFileSource]) {
    for source in sources.iter_mut() {
        source.dispose();
    }
}

fn scratch_file(dir: Option<&Path>) -> Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("postmux-").suffix(".tmp");
    match dir {
        Some(dir) => builder.tempfile_in(dir).map_err(|e| Error::file_creation(dir, e)),
        None => builder
            .tempfile()
            .map_err(|e| Error::file_creation(std::env::temp_dir(), e)),
    }
}

fn describe_fault(fault: &WriteFault<'_>) -> String {
    match fault {
        WriteFault::Stalled {
            safe_offset,
            pending,
        } => format!(
            "output cannot advance past offset {} ({} bytes buffered)",
            safe_offset, pending
        ),
        WriteFault::Io(err) => format!("write failed: {}", err),
    }
}

fn discard_damaged(path: &Path) {
    tracing::warn!("Removing partially rewritten file {:?}", path);
    if let Err(err) = fs::remove_file(path) {
        tracing::warn!("Failed to remove {:?}: {}", path, err);
    }
}
