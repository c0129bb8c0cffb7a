//! Configuration file management for the `autodev` CLI.
//!
//! A TOML config file at `~/.config/autodev/config.toml` carries the
//! scheduler configuration. Resolution chain for the knobs that have
//! other sources: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use autodev_core::config::SchedulerConfig;

/// The config file is the serialized scheduler configuration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Return the autodev config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/autodev` or
/// `~/.config/autodev`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("autodev");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("autodev")
}

/// Return the path to the config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns an error if it does not
/// exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

/// CLI-level overrides collected from flags.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub agent_binary: Option<String>,
    pub max_parallel: Option<usize>,
    pub no_auto_retry: bool,
    pub user_data_dir: Option<PathBuf>,
}

/// Resolve the scheduler configuration: CLI flag > env var > config
/// file > default.
pub fn resolve(overrides: &CliOverrides) -> Result<SchedulerConfig> {
    let mut config = load_config().map(|f| f.scheduler).unwrap_or_default();

    if let Ok(binary) = std::env::var("AUTODEV_AGENT_BIN") {
        config.agent_binary = binary;
    }
    if let Ok(dir) = std::env::var("AUTODEV_USER_DATA_DIR") {
        config.user_data_dir = Some(PathBuf::from(dir));
    }

    if let Some(ref binary) = overrides.agent_binary {
        config.agent_binary = binary.clone();
    }
    if let Some(max_parallel) = overrides.max_parallel {
        if max_parallel == 0 {
            bail!("--max-parallel must be at least 1");
        }
        config.max_parallel = max_parallel;
    }
    if overrides.no_auto_retry {
        config.auto_retry.enabled = false;
    }
    if let Some(ref dir) = overrides.user_data_dir {
        config.user_data_dir = Some(dir.clone());
    }

    Ok(config.clamped())
}
