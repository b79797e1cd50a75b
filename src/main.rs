mod cli;

use postmux::config::{self, Config, HoldPolicy};
use postmux::postprocessing::{
    self, Algorithm, ErrorCode, Mission, MissionHandle, MissionObserver, MissionState, RunOutcome,
    RunSettings, SourceSpec,
};
use postmux_media::ogg::{OggPageReader, OGG_MAGIC};
use postmux_media::stream::{peek_signature, ChunkFileSource};
use postmux_media::webm::EBML_MAGIC;
use postmux_media::{Mp4File, Track, TrackKind, WebmFile};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Logs progress and answers write holds according to the configured policy.
struct CliObserver {
    policy: HoldPolicy,
    max_retries: u32,
    retries: AtomicU32,
    last_percent: AtomicU64,
}

impl CliObserver {
    fn new(config: &Config) -> Self {
        Self {
            policy: config.postprocessing.hold_policy,
            max_retries: config.postprocessing.max_hold_retries,
            retries: AtomicU32::new(0),
            last_percent: AtomicU64::new(u64::MAX),
        }
    }
}

impl MissionObserver for CliObserver {
    fn on_progress(&self, done: u64, length: u64) {
        if length == 0 {
            return;
        }
        let percent = done.saturating_mul(100) / length;
        if self.last_percent.swap(percent, Ordering::Relaxed) != percent {
            tracing::info!("[{:.0}%] {} / {} bytes", percent as f64, done, length);
        }
    }

    fn on_hold(&self, handle: &MissionHandle, cause: &str) {
        let attempt = self.retries.fetch_add(1, Ordering::Relaxed) + 1;
        match self.policy {
            HoldPolicy::Retry if attempt <= self.max_retries => {
                tracing::warn!("Retrying after hold ({}/{}): {}", attempt, self.max_retries, cause);
                handle.resume();
            }
            _ => {
                tracing::error!("Aborting after hold: {}", cause);
                handle.abort();
            }
        }
    }

    fn on_finished(&self, state: MissionState, code: ErrorCode) {
        tracing::debug!("Mission finished: {:?} ({})", state, code);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "postmux=trace,postmux_media=trace".to_string()
        } else {
            "postmux=info,postmux_media=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            algorithm,
            output,
            sources,
            offsets,
            args,
            same_file,
        } => {
            let config = config::load_config_or_default(cli.config.as_deref())?;
            run_mission(&config, algorithm, output, &sources, &offsets, args, same_file)
        }
        Commands::Probe { file, json } => probe_file(&file, json),
        Commands::Algorithms => list_algorithms(),
        Commands::Validate { file } => validate_config(file.as_deref().or(cli.config.as_deref())),
    }
}

fn run_mission(
    config: &Config,
    algorithm: String,
    output: PathBuf,
    sources: &[String],
    offsets: &[u64],
    args: Vec<String>,
    same_file: bool,
) -> Result<()> {
    let specs = sources
        .iter()
        .map(|s| s.parse::<SourceSpec>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;

    let mission = if same_file {
        let offsets = if !offsets.is_empty() {
            offsets.to_vec()
        } else if !specs.is_empty() {
            specs.iter().map(|s| s.offset).collect()
        } else {
            vec![0]
        };
        Mission::same_file(algorithm, output, &offsets).with_args(args)
    } else {
        if specs.is_empty() {
            anyhow::bail!("at least one --source is required");
        }
        Mission::separate(algorithm, specs, output).with_args(args)
    };

    let settings = RunSettings::from_config(config);
    let handle = MissionHandle::with_observer(Arc::new(CliObserver::new(config)));

    match postprocessing::run(&mission, &settings, &handle) {
        Ok(RunOutcome::Completed { length }) => {
            println!("{}: wrote {} bytes to {}", mission.algorithm, length, mission.output.display());
            Ok(())
        }
        Ok(RunOutcome::Skipped) => {
            println!("{}: nothing to do for {}", mission.algorithm, mission.output.display());
            Ok(())
        }
        Err(err) => Err(anyhow::anyhow!("{} failed with {}: {}", mission.algorithm, err.code(), err)),
    }
}

#[derive(Serialize)]
struct TrackSummary {
    index: usize,
    id: u64,
    kind: TrackKind,
    codec: String,
    language: Option<String>,
    duration_secs: f64,
    samples: usize,
    bytes: u64,
    width: Option<u32>,
    height: Option<u32>,
    sample_rate: Option<f64>,
    channels: Option<u16>,
}

impl TrackSummary {
    fn new(index: usize, track: &Track) -> Self {
        Self {
            index,
            id: track.id,
            kind: track.kind,
            codec: track.codec_id.clone(),
            language: track.language.clone(),
            duration_secs: track.duration_secs(),
            samples: track.samples.len(),
            bytes: track.total_size(),
            width: track.video.map(|v| v.width),
            height: track.video.map(|v| v.height),
            sample_rate: track.audio.map(|a| a.sample_rate),
            channels: track.audio.map(|a| a.channels),
        }
    }
}

#[derive(Serialize)]
struct ProbeReport {
    file: PathBuf,
    container: String,
    size: u64,
    duration_secs: f64,
    tracks: Vec<TrackSummary>,
}

fn probe_file(path: &Path, json: bool) -> Result<()> {
    let mut source =
        ChunkFileSource::open(path, 0, None).with_context(|| format!("Failed to open {:?}", path))?;
    let size = std::fs::metadata(path)?.len();

    let report = match peek_signature(&mut source)? {
        Some(magic) if magic == EBML_MAGIC => {
            let webm = WebmFile::parse(&mut source, 0)?;
            ProbeReport {
                file: path.to_path_buf(),
                container: webm.doc_type.clone(),
                size,
                duration_secs: webm.duration_secs(),
                tracks: summarize(&webm.tracks),
            }
        }
        Some(magic) if magic == OGG_MAGIC => {
            let pages = OggPageReader::new(&mut source).read_all()?;
            let mut serials: Vec<u32> = pages.iter().map(|p| p.serial).collect();
            serials.sort_unstable();
            serials.dedup();
            println!("File: {}", path.display());
            println!("Container: ogg");
            println!("Pages: {}", pages.len());
            println!("Logical streams: {}", serials.len());
            if let Some(last) = pages.last() {
                println!("Last granule: {}", last.granule_position);
            }
            return Ok(());
        }
        _ => {
            let mp4 = Mp4File::parse(&mut source, 0)?;
            ProbeReport {
                file: path.to_path_buf(),
                container: format!("mp4 ({})", mp4.brand_str()),
                size,
                duration_secs: mp4.duration_secs(),
                tracks: summarize(&mp4.tracks),
            }
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("File: {}", report.file.display());
    println!("Container: {}", report.container);
    println!("Size: {} bytes", report.size);
    let secs = report.duration_secs as u64;
    println!("Duration: {:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60);

    println!("\nTracks: {}", report.tracks.len());
    for track in &report.tracks {
        print!(
            "  [{}] #{} {} {} ({} samples, {} bytes)",
            track.index, track.id, track.kind, track.codec, track.samples, track.bytes
        );
        if let (Some(width), Some(height)) = (track.width, track.height) {
            print!(" {}x{}", width, height);
        }
        if let (Some(rate), Some(channels)) = (track.sample_rate, track.channels) {
            print!(" {}Hz {}ch", rate, channels);
        }
        if let Some(lang) = &track.language {
            print!(" [{}]", lang);
        }
        println!();
    }

    Ok(())
}

fn summarize(tracks: &[Track]) -> Vec<TrackSummary> {
    tracks
        .iter()
        .enumerate()
        .map(|(i, track)| TrackSummary::new(i, track))
        .collect()
}

fn list_algorithms() -> Result<()> {
    for (name, algorithm) in Algorithm::registry() {
        println!("{:<12} {}", name, algorithm.description());
    }
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let pp = &config.postprocessing;
    println!(
        "  Temp dir: {}",
        pp.temp_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "(system)".to_string())
    );
    println!("  Progress interval: {} bytes", pp.progress_interval);
    println!("  Aux threshold: {} bytes", pp.aux_threshold);
    println!("  Stall limit: {}", pp.stall_limit);
    println!("  Hold policy: {:?} (max {} retries)", pp.hold_policy, pp.max_hold_retries);
    println!("  MP4 chunk: {} ms", config.mp4.chunk_ms);

    Ok(())
}
