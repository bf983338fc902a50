//! Queue worker: runs one job at a time as the worker user named by
//! `WORKERUSER`.

use anyhow::{bail, Result};
use autotest_core::config::{ConfigLoader, KNOWN_QUEUES};
use autotest_core::runner::workspace::prepare_scratch;
use autotest_core::{users, AutotestError, Worker};
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

const WORKER_USER_VAR: &str = "WORKERUSER";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Autotest Worker - Run queued grading jobs")]
struct Cli {
    /// Queues to listen on, highest priority first
    #[clap(required = true)]
    queues: Vec<String>,

    #[clap(long, short, help = "Configuration file (defaults to $AUTOTESTER_CONFIG)")]
    config: Option<PathBuf>,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    if let Some(queue) = cli.queues.iter().find(|q| !KNOWN_QUEUES.contains(&q.as_str())) {
        bail!("unknown queue '{}'", queue);
    }

    let config = ConfigLoader::load(cli.config.as_deref()).await?;
    let user = match std::env::var(WORKER_USER_VAR) {
        Ok(user) if !user.is_empty() => user,
        _ => users::current_user()?,
    };
    if config.worker(&user).is_none() {
        return Err(AutotestError::ConfigError(format!(
            "no worker is configured for user '{}'",
            user
        ))
        .into());
    }

    prepare_scratch(&config.worker_dir(&user), &user)?;
    let kv = autotest_core::kv::connect(&config.redis_url).await?;
    kv.ping().await?;

    log::info!("Starting worker {} on queues {:?}", user, cli.queues);
    let worker = Worker::new(Arc::new(config), kv, Some(user), cli.queues);

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });
    worker.run(rx).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, finishing current job...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, finishing current job...");
        },
    }
}
