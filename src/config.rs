//! Configuration loading and runtime paths.
//!
//! Confluence keeps everything under one root directory (`~/.confluence/`):
//! - `config.toml`: human-owned tuning (polling cadence, worker count)
//! - `state.json`: key digest and droplet settings, written by the app
//! - `.env`: optional `CONFLUENCE_MASTER_KEY` for unattended runs
//! - `logs/`: rotated JSON logs

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Top-level human-owned configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Poll scheduling.
    #[serde(default)]
    pub polling: PollingConfig,
}

/// Poll scheduling knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Seconds between poll cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Seconds a cycle waits for slow droplets before merging without them.
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,

    /// Maximum droplets polled at once.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
            workers: default_workers(),
        }
    }
}

impl PollingConfig {
    /// Cycle interval as a [`Duration`] (at least one second).
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Per-cycle deadline as a [`Duration`] (at least one second).
    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs.max(1))
    }

    /// Worker count, at least one.
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }
}

// Default value functions for serde

fn default_interval_secs() -> u64 {
    60
}
fn default_cycle_timeout_secs() -> u64 {
    30
}
fn default_workers() -> usize {
    4
}

/// Load the human-owned config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Load the config, falling back to defaults when the file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

/// Resolve the default config directory (`~/.confluence/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".confluence"))
}

/// Resolved locations of every runtime file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Root directory.
    pub root: PathBuf,
    /// Human-owned configuration.
    pub config_toml: PathBuf,
    /// Persisted state document.
    pub state_json: PathBuf,
    /// Optional credentials file.
    pub env_file: PathBuf,
    /// Log directory.
    pub logs_dir: PathBuf,
}

impl RuntimePaths {
    /// Paths under an explicit root.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_toml: root.join("config.toml"),
            state_json: root.join("state.json"),
            env_file: root.join(".env"),
            logs_dir: root.join("logs"),
            root,
        }
    }
}

/// Paths under [`config_dir`].
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    Ok(RuntimePaths::under(config_dir()?))
}
