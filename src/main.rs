// src/main.rs

use anyhow::Result;
use clap::Parser;
use snapboot::cli::{Cli, Commands};
use snapboot::commands;
use snapboot::config::Config;
use std::io::{BufRead, IsTerminal};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// The package-manager transaction's package list, one name per line on
/// stdin. Nothing is read when stdin is a terminal.
fn packages_from_stdin() -> Vec<String> {
    let stdin = std::io::stdin();

    if stdin.is_terminal() {
        return Vec::new();
    }

    stdin
        .lock()
        .lines()
        .map_while(|line| line.ok())
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Kill switch for recovery shells and chroots. Presence alone disables;
/// `SNAPBOOT_DISABLE=` (empty) counts as set.
fn disabled(value: Option<std::ffi::OsString>) -> bool {
    value.is_some()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if disabled(std::env::var_os("SNAPBOOT_DISABLE")) {
        info!("SNAPBOOT_DISABLE is set, doing nothing");
        return Ok(());
    }

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Init => commands::init(&config)?,
        Commands::Create { kind } => {
            let packages = packages_from_stdin();
            commands::create(&config, kind.into(), &packages)?;
        }
        Commands::Reconcile => commands::reconcile(&config)?,
        Commands::List => commands::list(&config)?,
    }

    Ok(())
}
