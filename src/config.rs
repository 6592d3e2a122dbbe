//! Configuration system using TOML files.
//!
//! Config is stored in the OS-standard config directory:
//! - Windows: %APPDATA%\servestream\config.toml
//! - macOS: ~/Library/Application Support/servestream/config.toml
//! - Linux: ~/.config/servestream/config.toml
//!
//! The playback core reads [`Preferences`] verbatim; it never writes them.
//! Capability flags in [`PlatformConfig`] are resolved once at startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// User preferences consumed by the playback core
    pub preferences: Preferences,

    /// Metadata pipeline timings
    pub metadata: MetadataConfig,

    /// Playback state machine tuning
    pub playback: PlaybackConfig,

    /// External player programs
    pub backend: BackendConfig,

    /// Platform capability flags
    pub platform: PlatformConfig,

    /// Track store settings
    pub library: LibraryConfig,
}

/// Boolean preference flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Hold a Wi-Fi performance lock while streaming
    pub wifi_lock: bool,
    /// Probe newly queued tracks for tags
    pub retrieve_metadata: bool,
    /// Poll live streams for in-band titles
    pub retrieve_shoutcast_metadata: bool,
    /// Store embedded artwork found by the batch probe
    pub retrieve_album_art: bool,
    /// Download remote tracks fully before playing them
    pub progressive_download: bool,
    /// Always use the demuxer backend for remote playback
    pub use_alternate_backend: bool,
    /// Keep the CPU awake during playback
    pub wakelock: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            wifi_lock: true,
            retrieve_metadata: false,
            retrieve_shoutcast_metadata: false,
            retrieve_album_art: false,
            progressive_download: false,
            use_alternate_backend: false,
            wakelock: true,
        }
    }
}

/// Metadata refresh timings (milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Delay before the batch probe starts
    pub probe_initial_delay_ms: u64,
    /// Pause between two batch probes
    pub probe_spacing_ms: u64,
    /// Interval between live stream polls
    pub poll_interval_ms: u64,
    /// Connect/read timeout for one poll
    pub poll_timeout_ms: u64,
    /// Upper bound on bytes fetched when probing a remote file's tags
    pub max_probe_bytes: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            probe_initial_delay_ms: 3_000,
            probe_spacing_ms: 1_000,
            poll_interval_ms: 10_000,
            poll_timeout_ms: 6_000,
            max_probe_bytes: 512 * 1024,
        }
    }
}

impl MetadataConfig {
    pub fn probe_initial_delay(&self) -> Duration {
        Duration::from_millis(self.probe_initial_delay_ms)
    }

    pub fn probe_spacing(&self) -> Duration {
        Duration::from_millis(self.probe_spacing_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Playback state machine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Delay before skipping past a track that failed to open
    pub retry_delay_ms: u64,
    /// "Previous" restarts the track once playback passed this point
    pub previous_restart_threshold_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 2_000,
            previous_restart_threshold_ms: 2_000,
        }
    }
}

/// External programs driven by the process backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Program that renders audio (`ffplay`-compatible arguments)
    pub player_program: String,
    /// Program that reports stream duration (`ffprobe`-compatible arguments)
    pub probe_program: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            player_program: "ffplay".to_string(),
            probe_program: "ffprobe".to_string(),
        }
    }
}

/// Capabilities of the host platform, fixed for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Wi-Fi lock supports the high-performance mode
    pub high_perf_wifi_lock: bool,
    /// The audio session honours "may duck" focus losses
    pub audio_ducking: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            high_perf_wifi_lock: true,
            audio_ducking: true,
        }
    }
}

/// Track store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Database file; `None` means `<data dir>/servestream/servestream.db`
    pub database_path: Option<PathBuf>,
}

impl LibraryConfig {
    /// Resolve the database file, falling back to the OS data directory.
    pub fn resolved_database_path(&self) -> PathBuf {
        if let Some(path) = &self.database_path {
            return path.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("servestream").join(crate::db::DEFAULT_DB_NAME))
            .unwrap_or_else(|| PathBuf::from(crate::db::DEFAULT_DB_NAME))
    }
}

// ============================================================================
// Config File Operations
// ============================================================================

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("servestream"))
}

/// Get the full path to the config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Directory for progressive downloads.
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("servestream"))
        .unwrap_or_else(std::env::temp_dir)
}

/// Load configuration from disk
///
/// Returns default config if file doesn't exist or can't be parsed.
/// Logs warnings but doesn't fail - we always return a usable config.
pub fn load() -> Config {
    let Some(path) = config_path() else {
        tracing::warn!("Could not determine config directory, using defaults");
        return Config::default();
    };
    load_from(&path)
}

/// Load configuration from an explicit path, with the same fallbacks as [`load`].
pub fn load_from(path: &std::path::Path) -> Config {
    if !path.exists() {
        tracing::info!("No config file found at {:?}, using defaults", path);
        return Config::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                tracing::error!("Failed to parse config file {:?}: {}", path, e);
                tracing::warn!("Using default configuration");
                Config::default()
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file {:?}: {}", path, e);
            Config::default()
        }
    }
}

/// Save configuration to an explicit path, atomically.
pub fn save_to(config: &Config, path: &std::path::Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::CreateDir(dir.to_path_buf(), e))?;
    }

    let contents = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;

    // Write atomically (write to temp, then rename)
    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &contents).map_err(|e| ConfigError::Write(temp_path.clone(), e))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| ConfigError::Rename(temp_path, path.to_path_buf(), e))?;

    tracing::info!("Saved config to {:?}", path);
    Ok(())
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to create config directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),

    #[error("Failed to write config to {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("Failed to rename temp file {0} to {1}: {2}")]
    Rename(PathBuf, PathBuf, std::io::Error),
}

// ============================================================================
// Tests
// ============================================================================
