use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use config::RunlaneConfig;

#[derive(Debug, Parser)]
#[command(name = "runlane", version, about = "Run and queue declarative pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a runner-less pipeline in this process.
    Run {
        #[arg(short, long)]
        file: PathBuf,
        /// Pipeline config override, `key=value`. Repeatable.
        #[arg(long = "config", value_name = "KEY=VALUE")]
        config: Vec<String>,
    },
    /// Check a pipeline file and print its validation errors.
    Validate {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Post a pipeline to a start endpoint.
    Submit {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(long)]
        endpoint: String,
        #[arg(long, env = "RUNLANE_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// List the tickets held by a runner's local semaphore.
    Queue {
        #[arg(long)]
        runner: String,
    },
    /// Retry failed cleanups from the record store.
    Reconcile {
        /// Stop after this many sweeps.
        #[arg(long)]
        iterations: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Run { file, config } => {
            let settings = RunlaneConfig::load()?;
            commands::run(&settings, &file, &config).await?;
        }
        Command::Validate { file } => {
            if !commands::validate(&file)? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Submit { file, endpoint, token } => {
            commands::submit(&file, &endpoint, token.as_deref()).await?;
        }
        Command::Queue { runner } => {
            let settings = RunlaneConfig::load()?;
            commands::queue(&settings, &runner).await?;
        }
        Command::Reconcile { iterations } => {
            let settings = RunlaneConfig::load()?;
            commands::reconcile(&settings, iterations).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
