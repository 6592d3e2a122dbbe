//! Player state and mode types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::{Track, TrackId};

/// Current playback status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Stopped,
    /// A data source is set and the backend is preparing it
    Opening,
    Playing,
    Paused,
}

/// Shuffle mode for the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShuffleMode {
    #[default]
    Off,
    On,
}

/// Repeat mode for the queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    /// Replay the current track when it ends
    Current,
    /// Wrap to the start of the queue
    All,
}

/// Where newly enqueued tracks go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueAction {
    /// Append and start playing the first inserted track
    Now,
    /// Insert right after the current track
    Next,
    /// Append
    Last,
}

/// Snapshot of the current track carried by notifications.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NowPlaying {
    pub id: Option<TrackId>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<String>,
    pub playing: bool,
}

impl NowPlaying {
    pub fn from_track(track: Option<&Track>, playing: bool) -> Self {
        match track {
            Some(t) => Self {
                id: Some(t.id),
                artist: t.artist.clone(),
                album: t.album.clone(),
                track: Some(t.display_title()),
                playing,
            },
            None => Self {
                playing,
                ..Self::default()
            },
        }
    }

    /// One-line "Artist - Title" rendering.
    pub fn display(&self) -> String {
        match (self.artist.as_deref(), self.track.as_deref()) {
            (Some(a), Some(t)) if !a.is_empty() => format!("{} - {}", a, t),
            (_, Some(t)) => t.to_string(),
            _ => "Nothing playing".to_string(),
        }
    }
}

/// Format a duration as MM:SS or HH:MM:SS.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, mins, secs)
    } else {
        format!("{}:{:02}", mins, secs)
    }
}
