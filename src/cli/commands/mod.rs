//! CLI command definitions and dispatch.
//!
//! Each subcommand is implemented in its own submodule:
//! - `library`: track rows (init, add, list, probe) and the ICY check
//! - `play`: running the playback service in the foreground

mod library;
mod play;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;

use crate::config::{self, Config};
use crate::player::state::RepeatMode;

pub use library::{cmd_add, cmd_icy, cmd_init, cmd_list, cmd_probe};
pub use play::cmd_play;

/// ServeStream playback engine
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Database path (defaults to the configured library database)
    #[arg(long, global = true, env = "SERVESTREAM_DB")]
    pub db: Option<PathBuf>,

    /// Config file (defaults to the OS config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and write a default config file if none exists
    Init,
    /// Add streams, files or directories of audio files
    Add {
        /// URIs, file paths or directories
        #[arg(required = true)]
        sources: Vec<String>,
        /// Recurse into directories
        #[arg(short, long)]
        recursive: bool,
    },
    /// List all tracks in the database
    List,
    /// Probe one track for tags and store what was found
    Probe {
        /// Track id
        id: i64,
        /// Also store embedded artwork
        #[arg(long)]
        artwork: bool,
    },
    /// Fetch the current ICY stream title of a radio URL
    Icy {
        /// Stream URL
        url: String,
    },
    /// Play tracks until the queue ends or Ctrl-C
    Play {
        /// Track ids; without ids the saved queue is resumed
        ids: Vec<i64>,
        /// Shuffle the queue
        #[arg(long)]
        shuffle: bool,
        /// Repeat mode
        #[arg(long, value_enum, default_value = "off")]
        repeat: RepeatMode,
        /// Pause after this many minutes
        #[arg(long)]
        sleep: Option<u32>,
    },
}

/// Run the specified CLI command.
///
/// Returns `Ok(true)` if a command was run, `Ok(false)` if no command was
/// specified (meaning usage should be printed).
pub fn run_command(cli: &Cli) -> anyhow::Result<bool> {
    let rt = Runtime::new()?;
    let config = load_config(cli.config.as_deref());
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| config.library.resolved_database_path());

    match &cli.command {
        Some(Commands::Init) => {
            let config_file = cli.config.clone().or_else(config::config_path);
            cmd_init(&rt, &db_path, config_file.as_deref(), &config)?;
            Ok(true)
        }
        Some(Commands::Add { sources, recursive }) => {
            cmd_add(&rt, &db_path, sources, *recursive)?;
            Ok(true)
        }
        Some(Commands::List) => {
            cmd_list(&rt, &db_path)?;
            Ok(true)
        }
        Some(Commands::Probe { id, artwork }) => {
            cmd_probe(&rt, &db_path, &config, *id, *artwork)?;
            Ok(true)
        }
        Some(Commands::Icy { url }) => {
            cmd_icy(&rt, &config, url)?;
            Ok(true)
        }
        Some(Commands::Play {
            ids,
            shuffle,
            repeat,
            sleep,
        }) => {
            cmd_play(&rt, &db_path, config, ids, *shuffle, *repeat, *sleep)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

// ============================================================================
// Shared helper functions
// ============================================================================

fn load_config(path: Option<&Path>) -> Config {
    match path {
        Some(path) => config::load_from(path),
        None => config::load(),
    }
}

/// Open (creating if needed) the database at `path`.
pub(crate) async fn open_db(path: &Path) -> anyhow::Result<sqlx::SqlitePool> {
    use anyhow::Context;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let url = crate::db::db_url(Some(path));
    crate::db::init_db(&url)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))
}

/// Collect audio files from a path (file or directory)
pub(crate) fn collect_audio_files(path: &Path, recursive: bool) -> Vec<PathBuf> {
    if !path.is_dir() {
        return vec![path.to_path_buf()];
    }
    let walker = walkdir::WalkDir::new(path)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .sort_by_file_name();
    walker
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_audio_file(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// Check if a path has an audio file extension
pub(crate) fn is_audio_file(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase());
    matches!(
        ext.as_deref(),
        Some("mp3" | "flac" | "ogg" | "m4a" | "aac" | "wav" | "opus" | "wma")
    )
}
