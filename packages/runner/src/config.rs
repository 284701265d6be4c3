// ABOUTME: TOML configuration file loading and validation for the runner daemon
// ABOUTME: Covers coordinator polling, LXD client credentials, and script compilation settings

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Top-level configuration, deserialized from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub runner: RunnerConfig,
    pub lxd: LxdConfig,
    #[serde(default)]
    pub script: ScriptConfig,
}

/// Coordinator polling and job placement settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Queue token scoping which jobs this runner receives.
    pub token: String,
    /// Coordinator base URL.
    pub endpoint: String,
    /// Directory receiving the per-job repository clones.
    pub repository_dir: PathBuf,
    /// Polling and reporting cadence in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Maximum number of concurrently executing jobs.
    #[serde(default = "default_instances")]
    pub instances: usize,
}

impl RunnerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

/// LXD API endpoint and client-certificate credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct LxdConfig {
    pub endpoint: String,
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub profiles: Vec<String>,
}

impl LxdConfig {
    pub fn cert_path(&self) -> PathBuf {
        expand_home(&self.cert)
    }

    pub fn key_path(&self) -> PathBuf {
        expand_home(&self.key)
    }
}

/// Marker prefix and in-container working directory for compiled scripts.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            workdir: default_workdir(),
        }
    }
}

fn default_interval() -> u64 {
    2
}

fn default_instances() -> usize {
    1
}

fn default_prefix() -> String {
    "kiln".to_string()
}

fn default_workdir() -> String {
    "/kiln".to_string()
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)?;
        config.validate()?;
        // Endpoints are joined with absolute paths everywhere else.
        config.runner.endpoint = config.runner.endpoint.trim_end_matches('/').to_string();
        config.lxd.endpoint = config.lxd.endpoint.trim_end_matches('/').to_string();
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.runner.token.is_empty() {
            return Err(ConfigError::Invalid {
                field: "runner.token",
                reason: "must not be empty".to_string(),
            });
        }
        if !self.runner.endpoint.starts_with("http://")
            && !self.runner.endpoint.starts_with("https://")
        {
            return Err(ConfigError::Invalid {
                field: "runner.endpoint",
                reason: format!("`{}` is not an http(s) URL", self.runner.endpoint),
            });
        }
        if self.runner.interval == 0 {
            return Err(ConfigError::Invalid {
                field: "runner.interval",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.runner.instances == 0 {
            return Err(ConfigError::Invalid {
                field: "runner.instances",
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.lxd.endpoint.starts_with("http://") && !self.lxd.endpoint.starts_with("https://")
        {
            return Err(ConfigError::Invalid {
                field: "lxd.endpoint",
                reason: format!("`{}` is not an http(s) URL", self.lxd.endpoint),
            });
        }
        if self.script.prefix.is_empty() {
            return Err(ConfigError::Invalid {
                field: "script.prefix",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
