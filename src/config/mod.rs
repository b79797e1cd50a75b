mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;
    expand_paths(&mut config);

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = ["./postmux.toml", "~/.config/postmux/config.toml"];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

fn expand_paths(config: &mut Config) {
    if let Some(dir) = config.postprocessing.temp_dir.take() {
        let expanded = shellexpand::tilde(&dir.to_string_lossy()).into_owned();
        config.postprocessing.temp_dir = Some(expanded.into());
    }
}

/// Validate configuration
fn validate_config(config: &Config) -> Result<()> {
    let pp = &config.postprocessing;

    if pp.progress_interval == 0 {
        anyhow::bail!("postprocessing.progress_interval cannot be 0");
    }

    if pp.stall_limit == 0 {
        anyhow::bail!("postprocessing.stall_limit cannot be 0");
    }

    if let Some(dir) = &pp.temp_dir {
        if !dir.exists() {
            tracing::warn!("Temp directory does not exist: {:?}", dir);
        }
    }

    if config.mp4.chunk_ms == 0 {
        anyhow::bail!("mp4.chunk_ms cannot be 0");
    }

    Ok(())
}
