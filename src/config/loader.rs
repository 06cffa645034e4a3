// Configuration loader
// Loads ~/.nettrain/config.toml (or an explicit path) and expands input patterns

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::settings::Config;
use crate::errors::PipelineError;

/// `~/.nettrain/config.toml`, when a home directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".nettrain/config.toml"))
}

/// Load configuration from an explicit file, else the default location, else defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }
        return read_config(path);
    }

    match default_config_path() {
        Some(path) if path.exists() => read_config(&path),
        _ => {
            tracing::debug!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}

fn read_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Loaded config");
    Ok(config)
}

pub fn parse_config(contents: &str) -> Result<Config> {
    toml::from_str(contents).context("Invalid config.toml")
}

/// Expand a glob into a sorted list of files. No match is a configuration error.
pub fn expand_pattern(pattern: &str) -> Result<Vec<PathBuf>> {
    let entries = glob::glob(pattern)
        .map_err(|e| PipelineError::config(format!("invalid pattern {:?}: {}", pattern, e)))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.with_context(|| format!("Failed to expand {}", pattern))?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(PipelineError::config(format!("no input files match {:?}", pattern)).into());
    }
    Ok(files)
}
