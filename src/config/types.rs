use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub postprocessing: PostprocessingConfig,

    #[serde(default)]
    pub mp4: Mp4Config,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostprocessingConfig {
    /// Directory for scratch files (default: system temp directory)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Bytes between progress notifications
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,

    /// Minimum scratch data moved into place at once while sources are read
    #[serde(default = "default_aux_threshold")]
    pub aux_threshold: u64,

    /// Writes without progress before a write hold is raised
    #[serde(default = "default_stall_limit")]
    pub stall_limit: u32,

    /// How the CLI answers a write hold
    #[serde(default)]
    pub hold_policy: HoldPolicy,

    /// Holds answered with a retry before the run is aborted
    #[serde(default = "default_max_hold_retries")]
    pub max_hold_retries: u32,
}

fn default_progress_interval() -> u64 {
    128 * 1024
}

fn default_aux_threshold() -> u64 {
    3 * 1024 * 1024
}

fn default_stall_limit() -> u32 {
    16
}

fn default_max_hold_retries() -> u32 {
    3
}

impl Default for PostprocessingConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            progress_interval: default_progress_interval(),
            aux_threshold: default_aux_threshold(),
            stall_limit: default_stall_limit(),
            hold_policy: HoldPolicy::default(),
            max_hold_retries: default_max_hold_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HoldPolicy {
    #[default]
    Abort,
    Retry,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Mp4Config {
    /// Decode time covered by one chunk in the rebuilt file
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u32,
}

fn default_chunk_ms() -> u32 {
    1000
}

impl Default for Mp4Config {
    fn default() -> Self {
        Self {
            chunk_ms: default_chunk_ms(),
        }
    }
}
