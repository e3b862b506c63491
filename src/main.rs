//! ffp-batch - compute monthly flux footprint volumes
//!
//! ```text
//! ffp-batch run --config run.toml
//! ```
//!
//! The hidden `worker` subcommand is what the pool spawns for each worker process.

use clap::{Parser, Subcommand};
use ffp_batch::config::RunConfig;
use ffp_batch::{pipeline, worker};
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ffp-batch")]
#[command(about = "Compute monthly flux footprint volumes from a meteorological time series")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every month of the configured input
    Run {
        /// Path to the TOML run configuration
        #[arg(long)]
        config: PathBuf,
    },
    /// Serve chunk tasks on stdin/stdout
    #[command(hide = true)]
    Worker,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Exit immediately with status 0 on Ctrl-C, leaving partial output in place
fn install_interrupt_handler() -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("Interrupted, exiting");
                        std::process::exit(0);
                    }
                    Err(e) => error!("Cannot listen for interrupts: {}", e),
                }
            })
        })?;
    Ok(())
}

fn run(config: PathBuf) -> ExitCode {
    if let Err(e) = install_interrupt_handler() {
        warn!("Interrupt handler not installed: {}", e);
    }

    let config = match RunConfig::from_file(&config) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Writing volumes to {} with {} workers",
        config.output.directory.display(),
        config.workers.count
    );

    match pipeline::run(&config) {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(summary) => {
            for (key, err) in &summary.failed {
                error!("{}: {}", key, err);
            }
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(config),
        Command::Worker => match worker::serve_stdio() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Worker failed: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}
