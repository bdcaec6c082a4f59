//! Daemon configuration, loaded from a TOML file.
//!
//! Every field has a default so the daemon runs with no file at all; a file
//! that exists but fails to parse is an error, not a silent fallback.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the HTTP API binds to.
    pub bind: String,
    /// SQLite database path.
    pub database: String,
    pub retention: RetentionConfig,
    pub clients: ClientsConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    /// Seconds between purge passes.
    pub interval_secs: u64,
    /// Record count that triggers a purge.
    pub max_cap: usize,
    /// Newest records always kept by a purge.
    pub min_cap: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientsConfig {
    /// Base URL of the message bus HTTP bridge.
    pub message_bus_url: String,
    /// Base URL of the device command service.
    pub command_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// File holding the JWT for outbound REST calls that request it.
    pub jwt_token_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "0.0.0.0:59861".to_string(),
            database: "data/cronwarden.db".to_string(),
            retention: RetentionConfig::default(),
            clients: ClientsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            interval_secs: 600,
            max_cap: 10_000,
            min_cap: 8_000,
        }
    }
}

impl Default for ClientsConfig {
    fn default() -> Self {
        ClientsConfig {
            message_bus_url: "http://localhost:6379".to_string(),
            command_url: "http://localhost:59882".to_string(),
        }
    }
}

impl Config {
    /// Read the file at `path`, or fall back to defaults when it does not
    /// exist.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention.interval_secs)
    }
}
