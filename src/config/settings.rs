// src/config/settings.rs: optional TOML settings file

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

use crate::config::defs::PipelineError;

pub const SETTINGS_FILE_NAME: &str = "amplicon-pipelines.toml";

/// Site-wide defaults. Every field can be overridden on the command line.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub threads: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub tools_dir: Option<PathBuf>,
    pub bin_dir: Option<PathBuf>,
    /// check-tab strict mode when `--strict` is not given
    pub strict_tables: Option<bool>,
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self, PipelineError> {
        toml::from_str(text).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidConfig(format!("Cannot read settings {}: {}", path.display(), e))
        })?;
        debug!("Loaded settings from {}", path.display());
        Self::from_toml_str(&text)
    }
}

/// Loads the explicit settings file if given, otherwise `$HOME/.config/amplicon-pipelines.toml`
/// when it exists. Absence of the default file is not an error.
pub fn load_settings(explicit: Option<&str>) -> Result<Settings, PipelineError> {
    if let Some(path) = explicit {
        return Settings::load(Path::new(path));
    }
    match default_settings_path() {
        Some(path) if path.is_file() => Settings::load(&path),
        _ => Ok(Settings::default()),
    }
}

fn default_settings_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join(SETTINGS_FILE_NAME))
}
