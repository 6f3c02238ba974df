//! Host Configuration
//!
//! `instance.toml` holds the frame-loop settings under `[host]` and the
//! instance options under `[instance]`. Environment variables prefixed with
//! `INSTANCE_` override file values, with `__` separating nested keys
//! (`INSTANCE_HOST__FRAMES=10`).

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};

use script_instance::InstanceOptions;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] figment::Error),
}

/// Full host configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub instance: InstanceOptions,
}

/// Frame loop and pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    /// Directory scripts are resolved against
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// Host frames to run before tearing down
    #[serde(default = "default_frames")]
    pub frames: u32,

    /// Host frame length in milliseconds
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,

    /// Maximum instances the broker may hand out
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("scripts")
}

fn default_frames() -> u32 {
    60
}

fn default_frame_interval_ms() -> u64 {
    16
}

fn default_pool_size() -> usize {
    4
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            scripts_dir: default_scripts_dir(),
            frames: default_frames(),
            frame_interval_ms: default_frame_interval_ms(),
            pool_size: default_pool_size(),
        }
    }
}

impl HostConfig {
    /// Load from a TOML file merged with `INSTANCE_` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("INSTANCE_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Frame length as seconds, the unit ticks are reported in
    pub fn frame_delta(&self) -> f32 {
        self.host.frame_interval_ms as f32 / 1000.0
    }
}
