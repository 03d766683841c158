//! Concord - drive the distributed mutex and queue from the command line

mod commands;
mod config;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use concord_concurrency::CancellationToken;
use tracing::{info, warn};

use crate::config::CliConfig;

#[derive(Debug, Parser)]
#[command(name = "concord", version, about)]
struct Cli {
    /// Config file (TOML, YAML or JSON)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    #[arg(long = "log-level")]
    log_level: Option<String>,
    /// Session lease TTL in seconds
    #[arg(long = "ttl")]
    ttl: Option<i64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Contend for one mutex from several sessions
    Lock {
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        contenders: Option<usize>,
        #[arg(long = "hold-ms")]
        hold_ms: Option<u64>,
    },
    /// Enqueue values and drain them in order
    Queue {
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        items: Option<usize>,
    },
}

impl Cli {
    fn overrides(&self) -> Vec<(&'static str, ::config::Value)> {
        let mut overrides = Vec::new();
        if let Some(v) = &self.log_level {
            overrides.push(("log_level", v.clone().into()));
        }
        if let Some(v) = self.ttl {
            overrides.push(("session.ttl_secs", v.into()));
        }
        match &self.command {
            Command::Lock {
                prefix,
                contenders,
                hold_ms,
            } => {
                if let Some(v) = prefix {
                    overrides.push(("lock.prefix", v.clone().into()));
                }
                if let Some(v) = contenders {
                    overrides.push(("lock.contenders", (*v as i64).into()));
                }
                if let Some(v) = hold_ms {
                    overrides.push(("lock.hold_ms", (*v as i64).into()));
                }
            }
            Command::Queue { prefix, items } => {
                if let Some(v) = prefix {
                    overrides.push(("queue.prefix", v.clone().into()));
                }
                if let Some(v) = items {
                    overrides.push(("queue.items", (*v as i64).into()));
                }
            }
        }
        overrides
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref(), cli.overrides())?;

    logging::init_logging(&config.log_level)?;
    concord_concurrency::metrics::describe_metrics();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling pending operations");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Lock { .. } => {
            info!(
                "Running {} contenders on {}",
                config.lock.contenders, config.lock.prefix
            );
            commands::run_lock(config.session, config.lock, cancel).await
        }
        Command::Queue { .. } => {
            info!(
                "Running queue demo with {} items on {}",
                config.queue.items, config.queue.prefix
            );
            commands::run_queue(config.queue, cancel).await
        }
    }
}
