// src/config.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use xdg::BaseDirectories;

pub const APP_NAME: &str = "ptysup";
pub const DEFAULT_CONFIG_FILENAME: &str = "config.toml";

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DefaultsConfig {
    #[serde(default = "default_agent_name_prefix")]
    pub agent_name_prefix: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_s")]
    pub flush_interval_s: u64,
}

fn default_agent_name_prefix() -> String {
    "agent".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_interval_s() -> u64 {
    5
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        DefaultsConfig {
            agent_name_prefix: default_agent_name_prefix(),
            batch_size: default_batch_size(),
            flush_interval_s: default_flush_interval_s(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_logs_root")]
    pub logs_root: String,
    #[serde(default = "default_data_root")]
    pub data_root: String,
    #[serde(default)]
    pub environments_file: Option<String>,
}

fn default_logs_root() -> String {
    "~/.ptysup/logs".to_string()
}
fn default_data_root() -> String {
    "~/.ptysup/data".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            logs_root: default_logs_root(),
            data_root: default_data_root(),
            environments_file: None,
        }
    }
}

impl Config {
    pub fn load(config_path_override: Option<&Path>) -> Result<Self> {
        let xdg_dirs = BaseDirectories::with_prefix(APP_NAME)?;
        let config_path = match config_path_override {
            Some(path) => path.to_path_buf(),
            None => xdg_dirs
                .find_config_file(DEFAULT_CONFIG_FILENAME)
                .unwrap_or_else(|| xdg_dirs.get_config_home().join(DEFAULT_CONFIG_FILENAME)),
        };

        debug!("loading configuration from {:?}", config_path);

        let mut config: Config = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read config file: {config_path:?}"))?;
            toml::from_str(&raw)
                .with_context(|| format!("failed to parse TOML config file: {config_path:?}"))?
        } else {
            warn!("config file not found at {:?}, using defaults", config_path);
            Config::default()
        };

        config.paths.logs_root = shellexpand::tilde(&config.paths.logs_root).into_owned();
        config.paths.data_root = shellexpand::tilde(&config.paths.data_root).into_owned();
        Ok(config)
    }

    pub fn logs_root(&self) -> PathBuf {
        PathBuf::from(&self.paths.logs_root)
    }

    pub fn data_root(&self) -> PathBuf {
        PathBuf::from(&self.paths.data_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config.defaults.batch_size, 100);
    }

    #[test]
    fn parses_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[defaults]\nbatch_size = 50\n\n[logging]\nlevel = \"debug\"\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.defaults.batch_size, 50);
        assert_eq!(config.logging.level, "debug");
    }
}
