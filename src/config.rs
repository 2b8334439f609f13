// Copyright 2020 Joyent, Inc.

//! Daemon configuration.
//!
//! Read from a TOML file. Every section and key has a default, so an empty
//! file (or no file at all) gives a working loopback configuration.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use slog::Level;

use crate::protocol::{DEFAULT_MAX_FRAME_SZ, FRAME_HEADER_SZ};
use crate::records::ConfigKv;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "SLURMDBD_CONF";

pub const DEFAULT_LISTEN: &str = "0.0.0.0:6819";
pub const DEFAULT_MESSAGE_TIMEOUT_SECS: u64 = 100;
pub const DEFAULT_COMMIT_INTERVAL_SECS: u64 = 10;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DbdConfig {
    pub server: ServerConfig,
    pub accounting: AccountingConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: String,
    /// Per-read timeout. An idle connection is closed when it expires.
    pub message_timeout_secs: u64,
    pub max_msg_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: DEFAULT_LISTEN.to_string(),
            message_timeout_secs: DEFAULT_MESSAGE_TIMEOUT_SECS,
            max_msg_size: DEFAULT_MAX_FRAME_SZ,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AccountingConfig {
    pub slurm_user_id: u32,
    /// Commit controller writes every `commit_interval_secs` instead of
    /// after each reply.
    pub commit_delay: bool,
    pub commit_interval_secs: u64,
    /// Tell registered controllers when accounting objects change.
    pub push_updates: bool,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        AccountingConfig {
            slurm_user_id: 0,
            commit_delay: false,
            commit_interval_secs: DEFAULT_COMMIT_INTERVAL_SECS,
            push_updates: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Trusted,
    Token,
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::Trusted
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub token: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: Option<PathBuf>,
        source: toml::de::Error,
    },
    Invalid {
        key: &'static str,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(
                f,
                "failed to read config file '{}': {}",
                path.display(),
                source
            ),
            ConfigError::Parse {
                path: Some(path),
                source,
            } => write!(
                f,
                "failed to parse config file '{}': {}",
                path.display(),
                source
            ),
            ConfigError::Parse { path: None, source } => {
                write!(f, "failed to parse config: {}", source)
            }
            ConfigError::Invalid { key, reason } => {
                write!(f, "invalid value for '{}': {}", key, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

pub fn parse_level(level: &str) -> Option<Level> {
    match level.to_ascii_lowercase().as_str() {
        "critical" => Some(Level::Critical),
        "error" => Some(Level::Error),
        "warning" | "warn" => Some(Level::Warning),
        "info" => Some(Level::Info),
        "debug" => Some(Level::Debug),
        "trace" => Some(Level::Trace),
        _ => None,
    }
}

impl DbdConfig {
    pub fn from_toml(content: &str) -> Result<DbdConfig, ConfigError> {
        let config: DbdConfig = toml::from_str(content)
            .map_err(|source| ConfigError::Parse { path: None, source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<DbdConfig, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DbdConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: Some(path.to_path_buf()),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, else from the file named by `SLURMDBD_CONF`, else
    /// use the defaults.
    pub fn load(path: Option<&Path>) -> Result<DbdConfig, ConfigError> {
        match path {
            Some(path) => DbdConfig::from_file(path),
            None => match env::var_os(CONFIG_ENV) {
                Some(path) => DbdConfig::from_file(PathBuf::from(path)),
                None => Ok(DbdConfig::default()),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.is_empty() {
            return Err(invalid("server.listen", "must not be empty"));
        }
        if self.server.message_timeout_secs == 0 {
            return Err(invalid("server.message_timeout_secs", "must be positive"));
        }
        if self.accounting.commit_interval_secs == 0 {
            return Err(invalid("accounting.commit_interval_secs", "must be positive"));
        }
        if self.server.max_msg_size < FRAME_HEADER_SZ {
            return Err(invalid(
                "server.max_msg_size",
                &format!("must be at least {} bytes", FRAME_HEADER_SZ),
            ));
        }
        if self.server.max_msg_size > i32::max_value() as usize {
            return Err(invalid("server.max_msg_size", "must fit in 31 bits"));
        }
        if parse_level(&self.logging.level).is_none() {
            return Err(invalid(
                "logging.level",
                &format!("unknown level '{}'", self.logging.level),
            ));
        }
        if self.auth.mode == AuthMode::Token
            && self.auth.token.as_deref().map(str::is_empty).unwrap_or(true)
        {
            return Err(invalid("auth.token", "token mode needs a token"));
        }
        Ok(())
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.server.message_timeout_secs)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.accounting.commit_interval_secs)
    }

    pub fn log_level(&self) -> Level {
        parse_level(&self.logging.level).unwrap_or(Level::Info)
    }

    /// Effective configuration as flat `section.key` pairs, secrets
    /// redacted.
    pub fn to_key_values(&self) -> Vec<ConfigKv> {
        let mut pairs = Vec::new();
        if let Ok(Value::Object(sections)) = serde_json::to_value(self) {
            for (section, value) in sections {
                if let Value::Object(keys) = value {
                    for (key, value) in keys {
                        let value = match (section.as_str(), key.as_str(), value) {
                            ("auth", "token", Value::Null) => "(null)".to_string(),
                            ("auth", "token", _) => "(redacted)".to_string(),
                            (_, _, Value::String(s)) => s,
                            (_, _, Value::Null) => "(null)".to_string(),
                            (_, _, other) => other.to_string(),
                        };
                        pairs.push(ConfigKv {
                            key: format!("{}.{}", section, key),
                            value,
                        });
                    }
                }
            }
        }
        pairs
    }
}
