use std::sync::Arc;

use events::{EventLog, MemoryEventLog};
use orchestrator::{ApprovalPolicy, EchoWorker, SessionRegistry, StaticPolicy, Worker};
use websocket::WsState;

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub ws: Arc<WsState>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        log: Arc<dyn EventLog>,
        worker: Arc<dyn Worker>,
        policy: Arc<dyn ApprovalPolicy>,
        config: ServerConfig,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            log,
            worker,
            policy,
            config.session.clone(),
        ));
        let ws = Arc::new(WsState::new(
            Arc::clone(&registry),
            config.heartbeat_interval(),
        ));

        Self {
            registry,
            ws,
            config: Arc::new(config),
        }
    }

    /// In-memory log, the echo worker and the configured static policy
    pub fn in_memory(config: ServerConfig) -> Self {
        let log = Arc::new(MemoryEventLog::with_config(config.log.clone()));
        let policy = Arc::new(StaticPolicy::new(config.policy.clone()));
        Self::new(log, Arc::new(EchoWorker), policy, config)
    }

    /// Evict idle sessions every `reap_interval` until the runtime shuts down
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let period = self.config.reap_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.reset();
            loop {
                ticker.tick().await;
                registry.reap_idle().await;
            }
        })
    }
}
