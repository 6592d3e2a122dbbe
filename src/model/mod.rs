//! Core data models for the track store.
//!
//! The playback core treats tracks as opaque [`TrackId`] handles and resolves
//! them through [`TrackStore`](crate::db::TrackStore) only when it needs a URI
//! or display metadata.
//!
//! # Database Schema
//!
//! - `tracks` - one row per stream or file, with optional tags and artwork
//! - `playback_state` - single row holding the serialized play queue

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::time::Duration;

/// Opaque track handle. The core never invents ids.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct TrackId(pub i64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TrackId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A resolvable track row.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Track {
    /// Database ID (auto-generated)
    pub id: TrackId,
    /// Stream URL or local file path
    pub uri: String,
    pub title: Option<String>,
    pub album: Option<String>,
    pub artist: Option<String>,
    /// Duration in milliseconds, when known
    pub duration_ms: Option<i64>,
    /// Embedded artwork bytes
    pub artwork: Option<Vec<u8>>,
}

impl Track {
    /// URI scheme in lowercase, `None` for bare paths.
    pub fn scheme(&self) -> Option<String> {
        uri_scheme(&self.uri)
    }

    /// Whether the URI points at the network rather than the local disk.
    pub fn is_remote(&self) -> bool {
        matches!(self.scheme().as_deref(), Some(s) if s != "file")
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }

    /// Title tag, or the last URI path segment when the track is untagged.
    pub fn display_title(&self) -> String {
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.to_string();
        }
        let tail = self
            .uri
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.uri);
        match urlencoding::decode(tail) {
            Ok(decoded) if !decoded.is_empty() => decoded.into_owned(),
            _ => self.uri.clone(),
        }
    }

    pub fn display_artist(&self) -> &str {
        self.artist.as_deref().unwrap_or("Unknown Artist")
    }

    pub fn display_album(&self) -> &str {
        self.album.as_deref().unwrap_or("Unknown Album")
    }
}

/// Partial update for a track row. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackUpdate {
    pub title: Option<String>,
    pub album: Option<String>,
    pub artist: Option<String>,
    pub duration_ms: Option<i64>,
    pub artwork: Option<Vec<u8>>,
}

impl TrackUpdate {
    /// At least one of title, album or artist is present.
    pub fn has_tags(&self) -> bool {
        self.title.is_some() || self.album.is_some() || self.artist.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_tags() && self.duration_ms.is_none() && self.artwork.is_none()
    }
}

/// Lowercased scheme of a URI such as `http://host/x`, `None` for plain paths.
pub fn uri_scheme(uri: &str) -> Option<String> {
    let (scheme, _) = uri.split_once("://")?;
    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(uri: &str) -> Track {
        Track {
            id: TrackId(1),
            uri: uri.to_string(),
            title: None,
            album: None,
            artist: None,
            duration_ms: None,
            artwork: None,
        }
    }

    #[test]
    fn test_uri_scheme() {
        assert_eq!(uri_scheme("HTTP://radio.example/live"), Some("http".into()));
        assert_eq!(uri_scheme("mmsh://media.example/a"), Some("mmsh".into()));
        assert_eq!(uri_scheme("/music/a.mp3"), None);
        assert_eq!(uri_scheme("://broken"), None);
    }

    #[test]
    fn test_is_remote() {
        assert!(track("http://radio.example/live").is_remote());
        assert!(track("rtsp://cam.example/audio").is_remote());
        assert!(!track("file:///music/a.mp3").is_remote());
        assert!(!track("/music/a.mp3").is_remote());
    }

    #[test]
    fn test_display_title_falls_back_to_uri() {
        let mut t = track("http://host.example/music/My%20Song.mp3");
        assert_eq!(t.display_title(), "My Song.mp3");

        t.title = Some("Tagged".to_string());
        assert_eq!(t.display_title(), "Tagged");
    }

    #[test]
    fn test_duration_ignores_non_positive() {
        let mut t = track("/a.mp3");
        t.duration_ms = Some(0);
        assert_eq!(t.duration(), None);
        t.duration_ms = Some(1500);
        assert_eq!(t.duration(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_update_has_tags() {
        let mut update = TrackUpdate::default();
        assert!(update.is_empty());
        update.duration_ms = Some(1000);
        assert!(!update.has_tags());
        update.artist = Some("Artist".into());
        assert!(update.has_tags());
    }
}
