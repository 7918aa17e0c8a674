use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use events::LogConfig;
use orchestrator::{PolicyConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";

/// Server configuration, read from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// SQLite URL for the durable event log; the log is kept in memory when unset
    pub database_url: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub reap_interval_secs: u64,
    pub session: SessionConfig,
    pub log: LogConfig,
    pub policy: PolicyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            database_url: None,
            heartbeat_interval_ms: 15_000,
            reap_interval_secs: 60,
            session: SessionConfig::default(),
            log: LogConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read config from `path`. A missing file yields defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}
