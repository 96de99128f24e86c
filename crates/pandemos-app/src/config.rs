use anyhow::{Context, Result};
use pandemos_core::{Controls, SimConfig};
use serde::Deserialize;
use std::{fs, path::Path};

/// Application configuration, loadable from a TOML file.
///
/// Both tables are optional; missing values fall back to defaults, so a
/// config file only needs the fields it overrides.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub simulation: SimConfig,
    pub controls: Controls,
}

impl AppConfig {
    /// Load from `path`, or produce the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .simulation
            .validate()
            .with_context(|| format!("failed to validate {}", path.display()))?;
        Ok(config)
    }
}
