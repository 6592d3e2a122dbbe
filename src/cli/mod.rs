//! Command-line interface for ServeStream.
//!
//! This module provides CLI commands for managing the track store, checking
//! stream metadata and running the playback service in the foreground.

mod commands;

pub use commands::{Cli, Commands, run_command};
