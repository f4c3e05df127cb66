//! Configuration loading.
//!
//! Settings are read from the first YAML file found among the candidates and
//! resolved into [`AcceleratorOptions`] and [`MaskOptions`]. A missing or
//! unreadable file falls back to built-in defaults with a warning.

mod defaults;

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::models::{AcceleratorOptions, MaskOptions};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "SHADOWMASK_CONFIG";

/// Canonical list of candidate config file names we search for on disk.
const CONFIG_FILENAMES: &[&str] = &["shadowmask.yml", "shadowmask.yaml"];

/// Complete configuration file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShadowmaskConfig {
    pub accelerator: AcceleratorOptions,
    pub mask: MaskOptions,
}

impl ShadowmaskConfig {
    fn sanitize(mut self, warnings: &mut Vec<String>) -> Self {
        self.accelerator.sanitize(warnings);
        self
    }
}

/// Public handle that stores the loaded configuration, its source path, and warnings.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    pub config: ShadowmaskConfig,
    pub source: Option<PathBuf>,
    pub warnings: Vec<String>,
}

impl ConfigHandle {
    fn with_config(config: ShadowmaskConfig, source: Option<PathBuf>, warnings: Vec<String>) -> Self {
        Self {
            config,
            source,
            warnings,
        }
    }

    /// Log where the configuration came from and any warnings.
    pub fn log_usage(&self) {
        match &self.source {
            Some(source) => debug!(path = %source.display(), "loaded config"),
            None => debug!("using built-in defaults"),
        }
        for warning in &self.warnings {
            warn!("config: {}", warning);
        }
    }
}

/// Load configuration from disk, optionally forcing a specific path.
pub fn load_config(custom_path: Option<&Path>) -> ConfigHandle {
    let mut warnings = Vec::new();

    for candidate in get_config_candidates(custom_path) {
        if !candidate.is_file() {
            if custom_path == Some(candidate.as_path()) {
                warnings.push(format!("Config file {} does not exist", candidate.display()));
            }
            continue;
        }

        match fs::read_to_string(&candidate) {
            Ok(contents) => match serde_yaml::from_str::<ShadowmaskConfig>(&contents) {
                Ok(config) => {
                    let config = config.sanitize(&mut warnings);
                    let source = fs::canonicalize(&candidate).unwrap_or(candidate);
                    return ConfigHandle::with_config(config, Some(source), warnings);
                }
                Err(err) => warnings.push(format!(
                    "Failed to parse config {}: {}",
                    candidate.display(),
                    err
                )),
            },
            Err(err) => warnings.push(format!(
                "Failed to read config {}: {}",
                candidate.display(),
                err
            )),
        }
    }

    warnings.push("No config found; using built-in defaults.".to_string());
    ConfigHandle::with_config(ShadowmaskConfig::default(), None, warnings)
}

/// Get list of config file candidates to try
fn get_config_candidates(custom_path: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(path) = custom_path {
        candidates.push(path.to_path_buf());
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        candidates.push(PathBuf::from(env_path));
    }

    if let Ok(cwd) = std::env::current_dir() {
        for name in CONFIG_FILENAMES {
            candidates.push(cwd.join("config").join(name));
            candidates.push(cwd.join(name));
        }
    }

    if let Some(config_dir) = dirs::home_dir().map(|home| home.join(".config")) {
        for name in CONFIG_FILENAMES {
            candidates.push(config_dir.join("shadowmask").join(name));
        }
    }

    candidates
}
