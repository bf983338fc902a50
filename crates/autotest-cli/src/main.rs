//! `autotest`: install, run and maintain an autotest host.

use anyhow::Result;
use autotest_cli::{queue_stats, Supervisor};
use autotest_core::config::ConfigLoader;
use autotest_core::{installer, AutotestConfig, SettingsManager};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Autotest - Operate the autotest grading service")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, global = true, help = "Configuration file (defaults to $AUTOTESTER_CONFIG)")]
    config: Option<PathBuf>,

    #[clap(long, short, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the host, create the workspace and install testers
    Install {
        /// Testers to install (all when omitted)
        #[clap(long = "tester")]
        testers: Vec<String>,
    },
    /// Start the worker pool under supervisord
    Start {
        /// Extra arguments for supervisord
        #[clap(last = true)]
        extra: Vec<String>,
    },
    /// Stop the worker pool
    Stop,
    /// Stop and start the worker pool
    Restart {
        #[clap(last = true)]
        extra: Vec<String>,
    },
    /// Show queue lengths and pop rates
    Stat,
    /// Expire settings that have not been used recently
    Clean {
        /// Expire settings unused for more than this many days
        #[clap(long, short, default_value_t = 0)]
        age: u64,

        /// Only list what would be expired
        #[clap(long, short)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let config = ConfigLoader::load(cli.config.as_deref()).await?;
    let supervisor = Supervisor::new(&config, Supervisor::default_worker_bin(), cli.config.clone());

    match cli.command {
        Commands::Install { testers } => install(config, &testers).await,
        Commands::Start { extra } => {
            supervisor.start(&config, &extra).await?;
            Ok(())
        }
        Commands::Stop => {
            if !supervisor.stop()? {
                eprintln!("supervisor is already stopped");
            }
            Ok(())
        }
        Commands::Restart { extra } => {
            if supervisor.stop()? {
                supervisor.wait_stopped().await?;
            }
            supervisor.start(&config, &extra).await?;
            Ok(())
        }
        Commands::Stat => {
            let kv = autotest_core::kv::connect(&config.redis_url).await?;
            for stat in queue_stats(kv.as_ref()).await? {
                println!("{}", stat);
            }
            Ok(())
        }
        Commands::Clean { age, dry_run } => clean(config, age, dry_run).await,
    }
}

async fn install(config: AutotestConfig, testers: &[String]) -> Result<()> {
    let kv = autotest_core::kv::connect(&config.redis_url).await?;
    let installed = installer::install(&config, kv.as_ref(), testers).await?;
    println!("Installed testers: {}", installed.join(", "));
    Ok(())
}

async fn clean(config: AutotestConfig, age: u64, dry_run: bool) -> Result<()> {
    let kv = autotest_core::kv::connect(&config.redis_url).await?;
    let config = Arc::new(config);
    let manager = SettingsManager::new(config.clone(), kv);
    let expired = manager.clean_stale(age, dry_run).await?;
    for id in &expired {
        let dir = config.settings_dir(*id);
        if dry_run {
            println!("{} -> would expire", dir.display());
        } else {
            println!("{} -> expired", dir.display());
        }
    }
    if expired.is_empty() {
        println!("No settings to expire");
    }
    Ok(())
}
