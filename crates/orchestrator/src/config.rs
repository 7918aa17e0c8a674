//! Session and approval configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use session_core::{PolicyDecision, PROTOCOL_VERSION};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reported as `v` on welcome and snapshot
    pub protocol_version: String,
    pub capabilities: Vec<String>,
    /// How long an aborting run may take to wind down before it is force-finalized
    pub abort_grace_ms: u64,
    /// Terminal runs kept per session for inspection
    pub run_history: usize,
    /// In-memory state of an unattached, idle session is evicted after this long
    pub idle_ttl_secs: u64,
    pub backpressure: BackpressureConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: vec!["approvals".to_string(), "resume".to_string()],
            abort_grace_ms: 5000,
            run_history: 16,
            idle_ttl_secs: 600,
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// Per-connection outbound queue thresholds, counted in frames
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub high_water: usize,
    pub low_water: usize,
    /// The connection is closed when its queue grows past this
    pub hard_limit: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_water: 256,
            low_water: 64,
            hard_limit: 1024,
        }
    }
}

/// Static tool approval rules keyed by tool name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Applied to tools not listed below
    pub default: PolicyDecision,
    pub allow: Vec<String>,
    pub deny_continue: Vec<String>,
    pub deny_abort: Vec<String>,
}
