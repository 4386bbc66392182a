//! logvault: collects closed log files from watched directories and ships
//! them to an object store.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use logvault_archive::{CosOutput, FileArchive};
use logvault_core::Registry;

mod cli;
use cli::{Cli, Command};

const TOOL_NAME: &str = "logvault";

const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILED_STARTUP: i32 = 1;
const EXIT_FORCE_QUIT: i32 = 2;
const EXIT_FAILED_QUIT: i32 = 3;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Version => {
            println!(
                "{TOOL_NAME} {} {}/{}",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            );
        }
        Command::Start { config } => {
            if let Err(err) = start(config).await {
                eprintln!("{TOOL_NAME}: {err:#}");
                process::exit(EXIT_FAILED_STARTUP);
            }
        }
    }
}

async fn start(config: PathBuf) -> Result<()> {
    let bytes = std::fs::read(&config)
        .with_context(|| format!("read {TOOL_NAME} config file {}", config.display()))?;

    let mut registry = Registry::new();
    registry.register(FileArchive::module_info());
    registry.register(CosOutput::module_info());

    let mut daemon = logvault_core::start(&bytes, Arc::new(registry)).await?;
    println!("Successfully started {TOOL_NAME}");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
        _ = sigquit.recv() => process::exit(EXIT_FORCE_QUIT),
    }

    match daemon.stop().await {
        Ok(()) => process::exit(EXIT_SUCCESS),
        Err(err) => {
            eprintln!("{TOOL_NAME} shutdown: {err}");
            process::exit(EXIT_FAILED_QUIT);
        }
    }
}
