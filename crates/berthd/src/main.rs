//! berthd - Berth release orchestration daemon
//!
//! Loads configuration, opens the datastore and runs the orchestrator over
//! the in-process event bus until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};

use berth_core::{init_tracing, InProcessBus, Orchestrator, OrchestratorConfig, METRICS};
use berth_state::{connect, Datastore, MemoryStore, SurrealStore};

#[derive(Parser, Debug)]
#[command(name = "berthd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Berth release orchestration daemon", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "BERTH_LOG_JSON")]
    json_logs: bool,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "BERTH_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Keep all state in memory (nothing survives a restart)
    #[arg(long, env = "BERTH_IN_MEMORY")]
    in_memory: bool,
}

async fn open_store(in_memory: bool, config: &OrchestratorConfig) -> Result<Arc<dyn Datastore>> {
    if in_memory {
        info!("using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let db = match &config.store.endpoint {
        Some(url) => {
            connect::connect_url(url, &config.store.namespace, &config.store.database).await
        }
        None => connect::connect_from_env().await,
    }
    .context("Failed to connect to Berth database")?;
    Ok(Arc::new(SurrealStore::new(db)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs, cli.log_level);

    let config = OrchestratorConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    let store = open_store(cli.in_memory, &config).await?;

    let (bus, stream) = InProcessBus::new();
    let engine = Arc::new(Orchestrator::new(store, Arc::new(bus), config)?);
    info!(
        version = berth_core::VERSION,
        subscriptions = ?engine.routes().subscriptions(),
        gate = engine.config().gate.is_enabled(),
        "berthd started"
    );

    engine
        .run(stream, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await;

    METRICS.flush();
    info!("berthd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::try_parse_from([
            "berthd",
            "--in-memory",
            "--json-logs",
            "--log-level",
            "debug",
            "--config",
            "berth.toml",
        ])
        .unwrap();
        assert!(cli.in_memory);
        assert!(cli.json_logs);
        assert_eq!(cli.log_level, Level::DEBUG);
        assert_eq!(cli.config, Some(PathBuf::from("berth.toml")));
    }

    #[tokio::test]
    async fn in_memory_store_opens() {
        let store = open_store(true, &OrchestratorConfig::default())
            .await
            .unwrap();
        assert!(store
            .find_environment_by_key("production")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn surreal_endpoint_from_config_opens() {
        let mut config = OrchestratorConfig::default();
        config.store.endpoint = Some("mem://".to_string());
        let store = open_store(false, &config).await.unwrap();
        assert!(store.find_user(&Default::default()).await.unwrap().is_none());
    }
}
