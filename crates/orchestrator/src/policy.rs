use serde_json::Value;
use session_core::PolicyDecision;

use crate::config::PolicyConfig;

/// Decides, before execution, how a tool call is authorized.
pub trait ApprovalPolicy: Send + Sync {
    fn evaluate(&self, tool_key: &str, args: &Value) -> PolicyDecision;
}

impl<F> ApprovalPolicy for F
where
    F: Fn(&str, &Value) -> PolicyDecision + Send + Sync,
{
    fn evaluate(&self, tool_key: &str, args: &Value) -> PolicyDecision {
        self(tool_key, args)
    }
}

/// Policy driven by per-tool lists. Denials take precedence over `allow`.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    config: PolicyConfig,
}

impl StaticPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Every tool runs without asking.
    pub fn allow_all() -> Self {
        Self::new(PolicyConfig {
            default: PolicyDecision::Allow,
            ..PolicyConfig::default()
        })
    }
}

impl ApprovalPolicy for StaticPolicy {
    fn evaluate(&self, tool_key: &str, _args: &Value) -> PolicyDecision {
        let listed = |list: &[String]| list.iter().any(|name| name == tool_key);

        if listed(&self.config.deny_abort) {
            PolicyDecision::DenyAbort
        } else if listed(&self.config.deny_continue) {
            PolicyDecision::DenyContinue
        } else if listed(&self.config.allow) {
            PolicyDecision::Allow
        } else {
            self.config.default
        }
    }
}
