// ABOUTME: Entry point for the kiln daemon binary
// ABOUTME: Parses arguments, loads configuration, and runs the job loop until shutdown

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use kiln_runner::{Config, Connection, GitCloner, LxdClient, Runner};

mod shutdown;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln CI runner - executes jobs in ephemeral LXD containers")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    config: PathBuf,

    /// Log filter override (falls back to RUST_LOG, then "info")
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = Config::load(&cli.config).context("failed to load configuration")?;
    let connection = Connection::new(config.runner.endpoint.clone())
        .context("failed to build coordinator client")?;
    let driver = Arc::new(LxdClient::new(&config.lxd).context("failed to build LXD client")?);

    let token = shutdown::install_handler();
    let runner = Runner::new(&config, connection, driver, Arc::new(GitCloner), token);

    info!(endpoint = %config.runner.endpoint, "kiln runner started");
    runner.run().await;
    info!("kiln runner stopped");

    Ok(())
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
