//! HTTP front end of the autotest grading service.

use anyhow::Result;
use autotest_api::{shutdown_signal, ApiServer, AppState};
use autotest_core::config::ConfigLoader;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Autotest Server - Run the autotest HTTP front end")]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(long, short, help = "Configuration file (defaults to $AUTOTESTER_CONFIG)")]
    config: Option<PathBuf>,

    #[clap(long, help = "Override the configured bind address")]
    bind_addr: Option<String>,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API (default command)
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    match cli.command {
        Some(Commands::Serve) | None => serve(cli.config, cli.bind_addr).await,
    }
}

async fn serve(config: Option<PathBuf>, bind_addr: Option<String>) -> Result<()> {
    let mut config = ConfigLoader::load(config.as_deref()).await?;
    if let Some(bind_addr) = bind_addr {
        config.server.bind_addr = bind_addr;
    }
    let kv = autotest_core::kv::connect(&config.redis_url).await?;
    kv.ping().await?;

    let state = AppState::new(Arc::new(config), kv);
    ApiServer::new(state)
        .serve_with_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
