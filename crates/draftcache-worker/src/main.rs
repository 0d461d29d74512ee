//! draftcache-worker - persistence worker for draft workspaces
//!
//! Drains write-back tasks queued by the edit path into the relational
//! artifact store and links the resulting artifact back to the workspace.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cli;
mod commands;
mod config;
mod services;
mod state;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::from_default_env()
        .add_directive("draftcache_worker=info".parse()?)
        .add_directive("draftcache_core=info".parse()?);
    let (text, json) = if cli.json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };
    tracing_subscriber::registry()
        .with(text)
        .with(json)
        .with(filter)
        .init();

    // Load configuration
    let config = config::Config::load()?;

    match cli.command {
        Commands::Run { workers } => commands::run::execute(workers, config).await,
        Commands::Replay { limit } => commands::replay::execute(limit, config).await,
        Commands::Status => commands::status::execute(cli.json, config).await,
    }
}
