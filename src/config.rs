//! Configuration file.
//!
//! Resolution order for the file itself:
//! 1. `--config <path>`
//! 2. `SCOREKEEP_CONFIG`
//! 3. `<config dir>/scorekeep/config.toml`
//!
//! A missing file means defaults. Every section and key is optional.

use crate::admission::{AdmissionPolicies, AdmissionPolicy, DEFAULT_SWEEP_INTERVAL};
use crate::coordinator::DEFAULT_MAX_ATTEMPTS;
use crate::error::ConfigError;
use crate::streaming::{DriverConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_IDLE_TIMEOUT, DEFAULT_PRODUCER_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "SCOREKEEP_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    pub admission: AdmissionConfig,
    pub persistence: PersistenceConfig,
    pub channel: ChannelConfig,
    pub producer: ProducerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Defaults to `<data dir>/scorekeep/scorekeep.db`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    pub sweep_interval_secs: u64,
    pub user: AdmissionPolicy,
    pub ip: AdmissionPolicy,
    pub installation: AdmissionPolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        let policies = AdmissionPolicies::default();
        Self {
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            user: policies.user,
            ip: policies.ip,
            installation: policies.installation,
        }
    }
}

impl AdmissionConfig {
    pub fn policies(&self) -> AdmissionPolicies {
        AdmissionPolicies {
            user: self.user,
            ip: self.ip,
            installation: self.installation,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistenceConfig {
    pub max_attempts: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    pub heartbeat_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProducerConfig {
    /// Program run once per job. Required to serve jobs.
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: DEFAULT_PRODUCER_TIMEOUT.as_secs(),
        }
    }
}

impl Config {
    /// Load from an explicit path, `SCOREKEEP_CONFIG`, or the default location.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::resolve_path(explicit) {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("scorekeep").join("config.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, policy) in [
            ("user", &self.admission.user),
            ("ip", &self.admission.ip),
            ("installation", &self.admission.installation),
        ] {
            if policy.window_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "admission.{}.window_secs must be greater than 0",
                    name
                )));
            }
        }
        if self.admission.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "admission.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.persistence.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "persistence.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.channel.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid(
                "channel.heartbeat_secs must be greater than 0".to_string(),
            ));
        }
        if self.channel.heartbeat_secs >= self.channel.idle_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "channel.heartbeat_secs ({}) must be shorter than channel.idle_timeout_secs ({})",
                self.channel.heartbeat_secs, self.channel.idle_timeout_secs
            )));
        }
        if self.producer.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "producer.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        match &self.database.path {
            Some(path) => expand_tilde(path),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("scorekeep")
                .join("scorekeep.db"),
        }
    }

    pub fn driver(&self) -> DriverConfig {
        DriverConfig {
            heartbeat_interval: Duration::from_secs(self.channel.heartbeat_secs),
            producer_timeout: Duration::from_secs(self.producer.timeout_secs),
            admission: self.admission.policies(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.channel.idle_timeout_secs)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
