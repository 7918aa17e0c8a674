use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use events::{EventLog, MemoryEventLog};
use orchestrator::{EchoWorker, StaticPolicy};
use server::config::ServerConfig;
use server::create_router;
use server::state::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "session-server")]
#[command(about = "Server-authoritative agent session protocol", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML config file; defaults apply when it does not exist
    #[arg(short, long, default_value = "session-server.toml")]
    config: PathBuf,

    /// Overrides `bind_addr`
    #[arg(short, long)]
    bind: Option<String>,

    /// Overrides `database_url`
    #[arg(long)]
    database_url: Option<String>,

    /// Keep the event log in memory even if a database is configured
    #[arg(long, conflicts_with = "database_url")]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = ServerConfig::load(&cli.config).await?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if cli.in_memory {
        config.database_url = None;
    } else if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }

    let log: Arc<dyn EventLog> = match &config.database_url {
        Some(url) => {
            tracing::info!("Event log: {}", url);
            let log = db::SqliteEventLog::connect(url, config.log.clone())
                .await
                .context("Failed to open event log database")?;
            Arc::new(log)
        }
        None => {
            tracing::warn!("No database configured, sessions are kept in memory only");
            Arc::new(MemoryEventLog::with_config(config.log.clone()))
        }
    };
    let policy = Arc::new(StaticPolicy::new(config.policy.clone()));

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(log, Arc::new(EchoWorker), policy, config);
    let reaper = state.spawn_reaper();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();
    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
