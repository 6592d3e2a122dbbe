//! ServeStream - a streaming media playback engine.
//!
//! Plays a queue of radio streams, remote files and local files through
//! external player programs. It handles queue order, shuffle and repeat,
//! audio focus, connectivity loss and live stream metadata, and persists the
//! queue across runs.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod metadata;
pub mod model;
pub mod net;
pub mod player;
pub mod task;
#[cfg(test)]
pub mod test_utils;

use clap::{CommandFactory, Parser};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    // Initialize logging; subsystems log under their own targets
    let mut filter = EnvFilter::from_default_env().add_directive("servestream=info".parse()?);
    for target in ["cli", "player", "metadata", "net"] {
        filter = filter.add_directive(format!("{target}=info").parse()?);
    }
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    if !cli::run_command(&args)? {
        cli::Cli::command().print_help()?;
    }
    Ok(())
}
