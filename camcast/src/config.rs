//! The TOML configuration file.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use capture::{Calibration, StreamConfig};
use log::info;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub sink: SinkSettings,
    /// When present, enables joint/depth sampling for every relayed frame.
    pub joints: Option<JointSettings>,
    /// When present, depth frames are software-aligned to the color grid
    /// instead of passed through.
    pub calibration: Option<Calibration>,
}

#[derive(Debug, Deserialize)]
pub struct SinkSettings {
    /// The virtual capture device the encoder publishes to.
    #[serde(default = "default_device")]
    pub device: PathBuf,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            device: default_device(),
        }
    }
}

fn default_device() -> PathBuf {
    PathBuf::from("/dev/video0")
}

#[derive(Debug, Deserialize)]
pub struct JointSettings {
    /// The file an external tracker appends normalized joint lines to.
    pub input: PathBuf,
    /// The append-only depth log written by this process.
    pub output: PathBuf,
}

impl AppConfig {
    /// Loads the config file, falling back to defaults when it is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path
            .try_exists()
            .with_context(|| format!("Failed to check for config file {}", path.display()))?
        {
            info!("No config file at {}; using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}
