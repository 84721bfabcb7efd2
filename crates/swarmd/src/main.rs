//! Swarm coordinator daemon.
//!
//! Opens the stream store, starts the coordinator's background loops and
//! runs until interrupted. Agents attach through the library API; the
//! daemon itself only hosts the services and reports their status.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use swarm_core::telemetry::init_tracing;
use swarm_core::{SwarmConfig, SwarmCoordinator};
use swarm_transport::{ConnectOptions, SurrealStreamStore};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "swarmd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Agent swarm coordinator daemon", long_about = None)]
struct Cli {
    /// SurrealDB endpoint for message streams (`mem://`, `surrealkv://path`, `ws://host`).
    /// Falls back to SURREALDB_ENDPOINT, then SURREALDB_URL, then memory.
    #[arg(long, env = "SWARM_DB_URL")]
    db_url: Option<String>,

    /// SurrealDB namespace (overrides SURREALDB_NAMESPACE)
    #[arg(long, env = "SWARM_DB_NAMESPACE")]
    db_namespace: Option<String>,

    /// SurrealDB database (overrides SURREALDB_DATABASE)
    #[arg(long, env = "SWARM_DB_DATABASE")]
    db_database: Option<String>,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "SWARM_LOG_JSON")]
    log_json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Seconds between status reports; 0 disables them
    #[arg(long, env = "SWARM_STATUS_INTERVAL_SECS", default_value_t = 60)]
    status_interval_secs: u64,
}

/// `SURREALDB_*` settings with the command-line overrides applied.
fn connect_options(cli: &Cli, base: ConnectOptions) -> ConnectOptions {
    let mut options = base;
    if let Some(url) = &cli.db_url {
        options = options.with_url(url);
    }
    if let Some(ns) = &cli.db_namespace {
        options = options.with_namespace(ns);
    }
    if let Some(db) = &cli.db_database {
        options = options.with_database(db);
    }
    options
}

async fn open_store(options: &ConnectOptions) -> Result<SurrealStreamStore> {
    SurrealStreamStore::open(options).await.with_context(|| {
        format!(
            "connecting to stream store at {} ({}/{})",
            options.url, options.namespace, options.database
        )
    })
}

async fn report_status(coordinator: &SwarmCoordinator) {
    let status = coordinator.status().await;
    info!(
        pending = status.scheduler.pending,
        active = status.scheduler.active,
        completed = status.scheduler.completed,
        agents = status.directory.total_agents,
        healthy = status.directory.healthy_agents,
        debates = status.active_debates,
        "swarm status"
    );
}

async fn run(cli: Cli) -> Result<()> {
    let config = SwarmConfig::from_env().context("loading SWARM_* configuration")?;
    let options = connect_options(&cli, ConnectOptions::from_env());
    let store = open_store(&options).await?;
    let coordinator = SwarmCoordinator::new(config, Arc::new(store))
        .context("building swarm coordinator")?;

    coordinator.start().await;
    info!("swarmd running; press Ctrl-C to stop");

    let interval = (cli.status_interval_secs > 0)
        .then(|| Duration::from_secs(cli.status_interval_secs));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for shutdown signal")?;
                break;
            }
            _ = async {
                match interval {
                    Some(every) => tokio::time::sleep(every).await,
                    None => std::future::pending().await,
                }
            } => {
                report_status(&coordinator).await;
            }
        }
    }

    info!("shutdown requested");
    coordinator.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.log_json, level);
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::try_parse_from([
            "swarmd",
            "--db-url",
            "mem://",
            "--log-json",
            "--status-interval-secs",
            "0",
        ])
        .unwrap();
        assert_eq!(cli.db_url.as_deref(), Some("mem://"));
        assert!(cli.log_json);
        assert_eq!(cli.status_interval_secs, 0);
    }

    #[test]
    fn flags_override_environment_options() {
        let cli = Cli::try_parse_from([
            "swarmd",
            "--db-url",
            "mem://",
            "--db-namespace",
            "swarm-test",
        ])
        .unwrap();
        let base = ConnectOptions::new("ws://db:8000")
            .with_database("streams")
            .with_credentials("svc", "pw", swarm_transport::AuthLevel::Database);

        let options = connect_options(&cli, base);
        assert_eq!(options.url, "mem://");
        assert_eq!(options.namespace, "swarm-test");
        assert_eq!(options.database, "streams");
        assert!(options.credentials.is_some());
    }

    #[tokio::test]
    async fn in_memory_store_opens() {
        let cli = Cli::try_parse_from(["swarmd", "--db-database", "smoke"]).unwrap();
        let options = connect_options(&cli, ConnectOptions::default());
        open_store(&options).await.unwrap();
    }
}
