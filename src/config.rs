use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::stages::{AmalgamationConfig, ExtractConfig, MasterConfig, ProviderConfig};

/// Configuration for a full pipeline run
///
/// Every section falls back to its defaults, so a TOML file only needs the
/// keys it changes:
///
/// ```toml
/// first_year = 2005
///
/// [master]
/// providers = ["PPSA", "MPSA", "Municipal"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// First year of the panel, inclusive
    pub first_year: i64,
    /// Last year of the panel, inclusive
    pub last_year: i64,
    pub extract: ExtractConfig,
    pub providers: ProviderConfig,
    pub amalgamation: AmalgamationConfig,
    pub master: MasterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            first_year: 2000,
            last_year: 2020,
            extract: ExtractConfig::default(),
            providers: ProviderConfig::default(),
            amalgamation: AmalgamationConfig::default(),
            master: MasterConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        if config.first_year > config.last_year {
            anyhow::bail!(
                "first_year {} is after last_year {}",
                config.first_year,
                config.last_year
            );
        }
        Ok(config)
    }

    /// Configured panel years in ascending order
    pub fn years(&self) -> Vec<i64> {
        (self.first_year..=self.last_year).collect()
    }
}
