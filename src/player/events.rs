//! Playback notifications.
//!
//! The service publishes a closed set of [`PlaybackEvent`]s on a broadcast
//! channel. Events are sent from the service loop only, so subscribers see
//! them in the order the transitions happened.

use tokio::sync::broadcast;

use super::state::NowPlaying;
use crate::model::TrackId;

/// User-visible failure notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Every entry in the queue failed to open in sequence
    PlaybackFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// Playing flag flipped
    PlayStateChanged(NowPlaying),
    /// Current track or its tags changed
    MetaChanged(NowPlaying),
    /// Batch probe stored tags for a track
    MetaRetrieved { id: TrackId },
    /// Batch probe stored artwork for a track
    ArtChanged { id: TrackId },
    QueueChanged,
    PlaybackStarted(NowPlaying),
    PlaybackComplete(NowPlaying),
    /// A track is being opened
    StartDialog,
    /// Opening finished, successfully or not
    StopDialog,
    ConnectivityChanged { connected: bool },
    Error { code: ErrorCode },
    PlayerClosed,
}

impl PlaybackEvent {
    /// Broadcast name used by external presenters.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlayStateChanged(_) => "playstatechanged",
            Self::MetaChanged(_) => "metachanged",
            Self::MetaRetrieved { .. } => "metaretrieved",
            Self::ArtChanged { .. } => "artchanged",
            Self::QueueChanged => "queuechanged",
            Self::PlaybackStarted(_) => "playbackstarted",
            Self::PlaybackComplete(_) => "playbackcomplete",
            Self::StartDialog => "startdialog",
            Self::StopDialog => "stopdialog",
            Self::ConnectivityChanged { connected: true } => "connectivityrestored",
            Self::ConnectivityChanged { connected: false } => "connectivitylost",
            Self::Error { .. } => "playbackfailed",
            Self::PlayerClosed => "playerclosed",
        }
    }
}

/// Fan-out of playback events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlaybackEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: PlaybackEvent) {
        tracing::debug!(target: "player::events", event = event.name(), "emit");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
