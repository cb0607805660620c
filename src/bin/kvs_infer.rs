//! kvs-infer - multi-camera video inference service.
//!
//! This daemon:
//! 1. Loads the YAML configuration
//! 2. Constructs the enabled publishers once, shared across workers
//! 3. Spawns one camera worker per enabled camera
//! 4. Serves /healthz and /metrics over HTTP
//! 5. Shuts down cleanly on SIGINT/SIGTERM (or POST /shutdown)
//!
//! Exit codes: 0 on graceful shutdown, 1 on missing config or fatal
//! startup error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;

use kvs_infer::config::AppConfig;
use kvs_infer::logger;
use kvs_infer::supervisor::Supervisor;

#[derive(Debug, Parser)]
#[command(name = "kvs-infer", version, about = "Multi-camera video inference over KVS HLS")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// HTTP listen address for /healthz and /metrics.
    #[arg(long, default_value = "0.0.0.0:8080")]
    http: String,
}

fn main() -> ExitCode {
    logger::init_from_env();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("fatal: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(&cli.config)?;
    let supervisor = Supervisor::new(config)?;

    let shutdown = supervisor.shutdown_flag();
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("cannot install signal handler")?;

    supervisor.run(&cli.http)
}
