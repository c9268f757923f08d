//! Relay Configuration
//!
//! Configuration is layered, lowest to highest precedence:
//!
//! 1. Built-in defaults
//! 2. TOML file (explicit path, else `~/.config/chat-relay/config.toml` if present)
//! 3. Environment variables
//! 4. Command-line overrides
//!
//! # File Format
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 3000
//!
//! [backend]
//! api_key = "..."
//! base_url = "https://generativelanguage.googleapis.com"
//! default_model = "gemini-2.5-flash"
//! connect_timeout_secs = 10
//! read_timeout_secs = 120     # max silence between reads, not total length
//!
//! [sessions]
//! idle_timeout_secs = 3600   # omit to keep sessions forever
//! sweep_interval_secs = 60
//! ```
//!
//! # Environment Variables
//!
//! - `HOST`, `PORT`: listen address
//! - `GEMINI_API_KEY`: backend credential
//! - `GEMINI_BASE_URL`: backend endpoint
//! - `GEMINI_MODEL`: default model
//! - `RELAY_IDLE_TIMEOUT_SECS`: idle eviction timeout (`0` disables)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{DEFAULT_BASE_URL, DEFAULT_MODEL};

/// Errors loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`RelayConfig`]
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Underlying parse error
        source: toml::de::Error,
    },
}

/// Where the file layer of a configuration came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    /// No file was loaded
    Defaults,
    /// Loaded from this file
    File(PathBuf),
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Defaults => f.write_str("defaults"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// `[server]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl ServerSettings {
    /// `host:port` string for binding
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `[backend]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Gemini API key
    pub api_key: Option<String>,
    /// Gemini API base URL
    pub base_url: String,
    /// Model used when a start request names none
    pub default_model: String,
    /// Upper bound on establishing the upstream connection
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated between two reads of an upstream response
    ///
    /// A stream that keeps producing is never cut off, however long it runs.
    pub read_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            connect_timeout_secs: 10,
            read_timeout_secs: 120,
        }
    }
}

impl BackendSettings {
    /// Connect timeout as a `Duration`
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Read timeout as a `Duration`
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }
}

/// `[sessions]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Evict completed sessions idle this long (None = never evict)
    pub idle_timeout_secs: Option<u64>,
    /// How often the sweeper runs when eviction is enabled
    pub sweep_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: None,
            sweep_interval_secs: 60,
        }
    }
}

impl SessionSettings {
    /// Idle timeout, if eviction is enabled
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Sweep interval as a `Duration`
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Complete relay configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listener settings
    pub server: ServerSettings,
    /// Backend settings
    pub backend: BackendSettings,
    /// Session lifecycle settings
    pub sessions: SessionSettings,
}

/// Command-line overrides (highest precedence)
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen host
    pub host: Option<String>,
    /// Listen port
    pub port: Option<u16>,
    /// Default model
    pub model: Option<String>,
    /// Idle eviction timeout in seconds (`0` disables)
    pub idle_timeout_secs: Option<u64>,
}

impl RelayConfig {
    /// Apply environment variables from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply environment variables from a lookup function
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("HOST") {
            self.server.host = host;
        }
        if let Some(port) = get("PORT").and_then(|v| parse_or_warn::<u16>("PORT", &v)) {
            self.server.port = port;
        }
        if let Some(key) = get("GEMINI_API_KEY") {
            self.backend.api_key = Some(key);
        }
        if let Some(url) = get("GEMINI_BASE_URL") {
            self.backend.base_url = url;
        }
        if let Some(model) = get("GEMINI_MODEL") {
            self.backend.default_model = model;
        }
        if let Some(secs) = get("RELAY_IDLE_TIMEOUT_SECS")
            .and_then(|v| parse_or_warn::<u64>("RELAY_IDLE_TIMEOUT_SECS", &v))
        {
            self.sessions.idle_timeout_secs = Some(secs);
        }
    }

    /// Apply command-line overrides
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(host) = &overrides.host {
            self.server.host.clone_from(host);
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(model) = &overrides.model {
            self.backend.default_model.clone_from(model);
        }
        if let Some(secs) = overrides.idle_timeout_secs {
            self.sessions.idle_timeout_secs = Some(secs);
        }
    }
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value, "Ignoring invalid environment value");
            None
        }
    }
}

/// Default config file path (`<config dir>/chat-relay/config.toml`)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chat-relay").join("config.toml"))
}

/// Load a config file
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the layered configuration
///
/// An explicit `path` must exist. Without one, the default path is used only
/// if it exists.
pub fn load_config(
    path: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<(RelayConfig, ConfigSource), ConfigError> {
    let file = match path {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path().filter(|p| p.is_file()),
    };

    let (mut config, source) = match file {
        Some(file) => (load_config_from_path(&file)?, ConfigSource::File(file)),
        None => (RelayConfig::default(), ConfigSource::Defaults),
    };

    config.apply_env();
    config.apply_overrides(overrides);

    Ok((config, source))
}
