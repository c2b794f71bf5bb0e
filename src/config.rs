use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batch::BatchSettings;
use crate::error::PipelineError;
use crate::memory::MemoryThresholds;
use crate::pairing::PairingConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub pairing: PairingConfig,

    #[serde(default)]
    pub batch: BatchSettings,

    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Where assets are written. The CLI argument takes precedence.
    #[serde(default = "default_destination")]
    pub destination: PathBuf,
    #[serde(default)]
    pub dry_run: bool,
    /// Where transcoded motion clips are staged.
    #[serde(default = "default_transcode_dir")]
    pub transcode_dir: PathBuf,
}

fn default_destination() -> PathBuf {
    dirs::picture_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photomigrate")
}

fn default_transcode_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("photomigrate")
        .join("motion")
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            dry_run: false,
            transcode_dir: default_transcode_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    #[serde(flatten)]
    pub thresholds: MemoryThresholds,
}

fn default_sample_interval_secs() -> u64 {
    5
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval_secs(),
            thresholds: MemoryThresholds::default(),
        }
    }
}

impl MemoryConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        self.batch.validate().map_err(PipelineError::Config)?;
        self.memory_thresholds().validate().map_err(PipelineError::Config)?;
        if self.pairing.tolerance_secs < 0 {
            return Err(PipelineError::Config("pairing.tolerance_secs must not be negative".to_string()));
        }
        Ok(())
    }

    /// Thresholds for the memory monitor. The batch section's high/critical values win.
    pub fn memory_thresholds(&self) -> MemoryThresholds {
        self.batch.apply_thresholds(self.memory.thresholds.clone())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PHOTOMIGRATE_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photomigrate")
            .join("config.toml")
    }
}
