//! Application-wide error types.
//!
//! Library modules use specific error types via `thiserror` (for example
//! [`BackendError`](crate::player::backend::BackendError) or
//! [`MetadataError`](crate::metadata::MetadataError)), which convert into the
//! top-level [`Error`]. The CLI uses `anyhow` for convenient propagation.
//!
//! Player backend failures never surface through this type while the
//! playback service is running: the backend selector turns them into posted
//! error events instead.
//!
//! # Example
//!
//! ```ignore
//! use servestream::error::{Error, Result};
//!
//! async fn resolve(store: &dyn TrackStore, id: TrackId) -> Result<Track> {
//!     store.get_track(id).await?.ok_or_else(|| Error::not_found("track", id))
//! }
//! ```

use std::fmt::Display;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level application error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Snapshot (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP or socket failure
    #[error("Network error: {0}")]
    Network(String),

    /// Player backend failure outside of a running service
    #[error("Backend error: {0}")]
    Backend(String),

    /// Metadata probing error
    #[error("Metadata error for {uri}: {message}")]
    Metadata { uri: String, message: String },

    /// Missing row or entity
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The playback service loop has exited
    #[error("Playback service is not running")]
    ServiceClosed,

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a metadata error.
    pub fn metadata(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Metadata {
            uri: uri.into(),
            message: message.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(kind: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Create a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Add context to an error.
    pub fn context(self, ctx: impl Into<String>) -> Self {
        Self::WithContext {
            context: ctx.into(),
            source: Box::new(self),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<crate::player::backend::BackendError> for Error {
    fn from(e: crate::player::backend::BackendError) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<crate::metadata::MetadataError> for Error {
    fn from(e: crate::metadata::MetadataError) -> Self {
        match e {
            crate::metadata::MetadataError::Network(message) => Self::Network(message),
            other => Self::Metadata {
                uri: String::new(),
                message: other.to_string(),
            },
        }
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(e: crate::config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn with_context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Io(e).context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Database(e).context(ctx))
    }
}
