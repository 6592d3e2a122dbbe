//! Playback core: queue, backends, focus and network handling, and the
//! service that ties them together.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  PlaybackHandle (any task)                      │
//! │          Transport, queue and mode requests, getters            │
//! └────────────────────────────┬────────────────────────────────────┘
//!                              │ mpsc
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                PlaybackService (single owner)                   │
//! │   PlayQueue, state machine, timers, focus and connectivity     │
//! └────────────────────────────┬────────────────────────────────────┘
//!                              │ MultiPlayer
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Native / Buffered / Demuxer backends               │
//! │          ffplay/ffprobe child processes, or test fakes          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod connectivity;
pub mod events;
pub mod focus;
pub mod queue;
pub mod service;
pub mod state;

pub use events::{EventBus, PlaybackEvent};
pub use queue::{PlayQueue, QueueSnapshot};
pub use service::{PlaybackHandle, PlaybackService, RemoteCommand, ServiceDeps};
pub use state::{EnqueueAction, NowPlaying, PlaybackStatus, RepeatMode, ShuffleMode};
