//! The playback service: one task that owns the queue, the backends and
//! every piece of playback state.
//!
//! # Architecture
//!
//! ```text
//!  PlaybackHandle ──┐
//!  backend events ──┤
//!  focus / network ─┼──► mpsc ──► PlaybackService::process ──► EventBus
//!  timers ──────────┤                    │
//!  workers ─────────┘                    ├── MultiPlayer (backends)
//!                                        ├── PlayQueue
//!                                        └── batch probe / poller / download
//! ```
//!
//! Everything that can be slow runs in a spawned worker and reports back
//! through the same channel, so state transitions happen one at a time and
//! notifications go out in transition order.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::backend::{
    BackendFactory, DataSource, MultiPlayer, MultiSignal, PlayerErrorKind, PlayerEvent,
};
use super::connectivity::{
    ConnectivityAction, ConnectivityMonitor, NetworkGuard, WifiLock, WifiLockManager,
};
use super::events::{ErrorCode, EventBus, PlaybackEvent};
use super::focus::{AudioSession, DUCK_VOLUME, FADE_TICK, FULL_VOLUME, FocusChange, RESUME_VOLUME, VolumeFader};
use super::queue::PlayQueue;
use super::state::{EnqueueAction, NowPlaying, PlaybackStatus, RepeatMode, ShuffleMode};
use crate::config::{Config, Preferences};
use crate::db::{TrackStore, WriteLocks};
use crate::error::{Error, Result};
use crate::metadata::batch::{BatchSettings, Retrieved, TrackProbe, run_batch};
use crate::metadata::poller::{PollerEvent, StreamMetadataSource, run_poller};
use crate::model::{Track, TrackId};
use crate::net::{ContentTypeProbe, Downloader};
use crate::task::WorkerHandle;

// ============================================================================
// Messages
// ============================================================================

/// Media-button and notification actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    TogglePause,
    Pause,
    /// Pause and rewind to the start of the track
    Stop,
    /// Restart the track, or go back when near its start
    Previous,
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    RetryNext,
    SleepTimer,
    Fade,
}

/// Point-in-time view of the service for getters.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStatus {
    pub queue: Vec<TrackId>,
    pub queue_position: Option<usize>,
    pub now_playing: NowPlaying,
    pub status: PlaybackStatus,
    pub playing: bool,
    /// `None` when no backend is initialised
    pub position: Option<Duration>,
    /// `None` when no backend is initialised or the stream is live
    pub duration: Option<Duration>,
    pub shuffle: ShuffleMode,
    pub repeat: RepeatMode,
    /// Sleep timer in minutes, 0 when off
    pub sleep_minutes: u32,
}

#[derive(Debug)]
pub enum Request {
    Open {
        ids: Vec<TrackId>,
        /// `None` picks a random entry
        position: Option<usize>,
    },
    Enqueue {
        ids: Vec<TrackId>,
        action: EnqueueAction,
    },
    Play,
    Pause,
    Stop,
    Previous,
    Next,
    Seek(Duration),
    SetQueuePosition(usize),
    RemoveTracks {
        first: usize,
        last: usize,
        reply: oneshot::Sender<usize>,
    },
    RemoveTrack {
        id: TrackId,
        reply: oneshot::Sender<usize>,
    },
    MoveQueueItem {
        from: usize,
        to: usize,
    },
    SetShuffle(ShuffleMode),
    SetRepeat(RepeatMode),
    SetSleepTimer(u32),
    Status(oneshot::Sender<PlayerStatus>),
}

#[derive(Debug)]
pub enum ServiceMessage {
    Request(Request),
    Player(MultiSignal),
    Focus(FocusChange),
    Connectivity {
        no_connectivity: bool,
        is_failover: bool,
        active_connected: bool,
    },
    Remote(RemoteCommand),
    Timer(TimerKind, u64),
    MetadataRetrieved(Retrieved),
    Poller(PollerEvent),
    Downloaded {
        generation: u64,
        result: std::result::Result<PathBuf, String>,
    },
    PreferencesChanged(Preferences),
    Shutdown(oneshot::Sender<()>),
}

/// Collaborators the service is built from.
pub struct ServiceDeps {
    pub store: Arc<dyn TrackStore>,
    pub backends: Box<dyn BackendFactory>,
    pub content_types: Arc<dyn ContentTypeProbe>,
    pub track_probe: Arc<dyn TrackProbe>,
    pub stream_source: Arc<dyn StreamMetadataSource>,
    /// Progressive download is unavailable without one
    pub downloader: Option<Downloader>,
    pub audio_session: Box<dyn AudioSession>,
    pub wifi_lock: Box<dyn WifiLock>,
    pub config: Config,
}

// ============================================================================
// Service
// ============================================================================

pub struct PlaybackService {
    tx: mpsc::UnboundedSender<ServiceMessage>,
    rx: mpsc::UnboundedReceiver<ServiceMessage>,
    events: EventBus,
    config: Config,

    store: Arc<dyn TrackStore>,
    track_probe: Arc<dyn TrackProbe>,
    stream_source: Arc<dyn StreamMetadataSource>,
    downloader: Option<Downloader>,
    audio_session: Box<dyn AudioSession>,
    write_locks: WriteLocks,

    player: MultiPlayer,
    queue: PlayQueue,
    current: Option<Track>,
    status: PlaybackStatus,

    is_supposed_to_be_playing: bool,
    paused_by_transient_loss: bool,
    paused_by_connectivity: bool,
    start_on_prepare: bool,
    keep_awake: bool,
    resume_seek: Option<Duration>,
    open_failures: usize,
    open_generation: u64,

    fader: VolumeFader,
    connectivity: ConnectivityMonitor,
    wifi: WifiLockManager,
    network_guard: Option<NetworkGuard>,

    sleep_minutes: u32,
    timer_seq: u64,
    sleep_timer: Option<(u64, WorkerHandle)>,
    retry_timer: Option<(u64, WorkerHandle)>,
    fade_timer: Option<(u64, WorkerHandle)>,

    batch: Option<WorkerHandle>,
    poller: Option<(TrackId, WorkerHandle)>,
    download: Option<WorkerHandle>,
}

impl PlaybackService {
    /// Build the service and a handle to control it. Nothing runs until
    /// [`run`](Self::run) is awaited.
    pub fn new(deps: ServiceDeps) -> (Self, PlaybackHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventBus::default();

        let signals = tx.clone();
        let player = MultiPlayer::new(
            deps.backends,
            deps.content_types,
            Arc::new(move |signal| {
                let _ = signals.send(ServiceMessage::Player(signal));
            }),
            deps.config.preferences.use_alternate_backend,
        );
        let wifi = WifiLockManager::new(
            deps.wifi_lock,
            deps.config.preferences.wifi_lock,
            deps.config.platform.high_perf_wifi_lock,
        );

        let handle = PlaybackHandle {
            tx: tx.clone(),
            events: events.clone(),
        };
        let service = Self {
            tx,
            rx,
            events,
            config: deps.config,
            store: deps.store,
            track_probe: deps.track_probe,
            stream_source: deps.stream_source,
            downloader: deps.downloader,
            audio_session: deps.audio_session,
            write_locks: WriteLocks::new(),
            player,
            queue: PlayQueue::new(),
            current: None,
            status: PlaybackStatus::Stopped,
            is_supposed_to_be_playing: false,
            paused_by_transient_loss: false,
            keep_awake: false,
            paused_by_connectivity: false,
            start_on_prepare: false,
            resume_seek: None,
            open_failures: 0,
            open_generation: 0,
            fader: VolumeFader::default(),
            connectivity: ConnectivityMonitor::default(),
            wifi,
            network_guard: None,
            sleep_minutes: 0,
            timer_seq: 0,
            sleep_timer: None,
            retry_timer: None,
            fade_timer: None,
            batch: None,
            poller: None,
            download: None,
        };
        (service, handle)
    }

    /// Restore the persisted queue, then process messages until shutdown.
    pub async fn run(mut self) {
        self.restore().await;
        while let Some(msg) = self.rx.recv().await {
            if !self.process(msg).await {
                break;
            }
        }
        info!(target: "player::service", "Playback service stopped");
    }

    /// Handle one message. Returns false once the service shut down.
    pub async fn process(&mut self, msg: ServiceMessage) -> bool {
        match msg {
            ServiceMessage::Request(request) => self.handle_request(request).await,
            ServiceMessage::Player(MultiSignal::Backend { instance, event }) => {
                if let Some(event) = self.player.handle_backend_event(instance, event) {
                    self.handle_player_event(event).await;
                }
            }
            ServiceMessage::Player(MultiSignal::ContentType {
                request,
                content_type,
            }) => self.player.on_content_type(request, &content_type),
            ServiceMessage::Focus(change) => self.handle_focus(change),
            ServiceMessage::Connectivity {
                no_connectivity,
                is_failover,
                active_connected,
            } => self.handle_connectivity(no_connectivity, is_failover, active_connected),
            ServiceMessage::Remote(command) => self.handle_remote(command).await,
            ServiceMessage::Timer(kind, seq) => self.handle_timer(kind, seq).await,
            ServiceMessage::MetadataRetrieved(retrieved) => self.on_metadata_retrieved(retrieved).await,
            ServiceMessage::Poller(event) => self.on_poller_event(event).await,
            ServiceMessage::Downloaded { generation, result } => {
                self.on_downloaded(generation, result).await
            }
            ServiceMessage::PreferencesChanged(preferences) => {
                self.apply_preferences(preferences)
            }
            ServiceMessage::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        self.sync_keep_awake();
        true
    }

    /// The wake lock follows playback while the preference allows it.
    fn sync_keep_awake(&mut self) {
        let wanted = self.is_supposed_to_be_playing && self.config.preferences.wakelock;
        if wanted != self.keep_awake {
            self.keep_awake = wanted;
            self.audio_session.set_keep_awake(wanted);
        }
    }

    /// Process every message that is ready without waiting for more.
    ///
    /// Yields first so spawned workers and timers get to post.
    pub async fn pump(&mut self) -> bool {
        for _ in 0..4 {
            tokio::task::yield_now().await;
            while let Ok(msg) = self.rx.try_recv() {
                if !self.process(msg).await {
                    return false;
                }
            }
        }
        true
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Open { ids, position } => self.open(ids, position).await,
            Request::Enqueue { ids, action } => self.enqueue(ids, action).await,
            Request::Play => self.play(),
            Request::Pause => {
                self.paused_by_transient_loss = false;
                self.pause().await;
            }
            Request::Stop => self.stop(),
            Request::Previous => self.previous().await,
            Request::Next => self.advance(true).await,
            Request::Seek(position) => self.seek(position),
            Request::SetQueuePosition(index) => self.set_queue_position(index).await,
            Request::RemoveTracks { first, last, reply } => {
                let removed = self.remove_tracks(first, last).await;
                let _ = reply.send(removed);
            }
            Request::RemoveTrack { id, reply } => {
                let removed = self.remove_track(id).await;
                let _ = reply.send(removed);
            }
            Request::MoveQueueItem { from, to } => self.move_queue_item(from, to).await,
            Request::SetShuffle(mode) => self.set_shuffle(mode).await,
            Request::SetRepeat(mode) => self.set_repeat(mode).await,
            Request::SetSleepTimer(minutes) => self.set_sleep_timer(minutes),
            Request::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn status(&self) -> PlayerStatus {
        PlayerStatus {
            queue: self.queue.tracks().to_vec(),
            queue_position: self.queue.position(),
            now_playing: self.now_playing(),
            status: self.status,
            playing: self.is_supposed_to_be_playing,
            position: self.player.position(),
            duration: self.player.duration(),
            shuffle: self.queue.shuffle(),
            repeat: self.queue.repeat(),
            sleep_minutes: self.sleep_minutes,
        }
    }

    fn now_playing(&self) -> NowPlaying {
        NowPlaying::from_track(self.current.as_ref(), self.is_supposed_to_be_playing)
    }

    /// Replace the queue and start playing at `position`.
    async fn open(&mut self, ids: Vec<TrackId>, position: Option<usize>) {
        if self.queue.open(&ids, position) {
            self.events.emit(PlaybackEvent::QueueChanged);
            self.start_batch(ids);
        }
        self.stop_playback();
        self.open_current(true).await;
        self.save_queue().await;
    }

    async fn enqueue(&mut self, ids: Vec<TrackId>, action: EnqueueAction) {
        if ids.is_empty() {
            return;
        }
        let outcome = self.queue.enqueue(&ids, action);
        self.events.emit(PlaybackEvent::QueueChanged);
        self.start_batch(ids);

        if outcome.open_current {
            self.stop_playback();
            self.open_current(true).await;
        } else {
            self.prestage_next().await;
        }
        self.save_queue().await;
    }

    async fn set_queue_position(&mut self, index: usize) {
        if self.queue.set_position(index) {
            self.stop_playback();
            self.open_current(true).await;
            self.save_queue().await;
        }
    }

    async fn remove_tracks(&mut self, first: usize, last: usize) -> usize {
        let outcome = self.queue.remove_range(first, last);
        self.after_removal(outcome.removed, outcome.current_removed)
            .await;
        outcome.removed
    }

    async fn remove_track(&mut self, id: TrackId) -> usize {
        let outcome = self.queue.remove_id(id);
        self.after_removal(outcome.removed, outcome.current_removed)
            .await;
        outcome.removed
    }

    async fn after_removal(&mut self, removed: usize, current_removed: bool) {
        if removed == 0 {
            return;
        }
        self.events.emit(PlaybackEvent::QueueChanged);
        if current_removed {
            let was_playing = self.is_supposed_to_be_playing;
            if self.queue.is_empty() {
                self.go_idle();
                self.current = None;
                self.events.emit(PlaybackEvent::MetaChanged(self.now_playing()));
            } else {
                self.stop_playback();
                self.open_current(was_playing).await;
            }
        } else {
            self.prestage_next().await;
        }
        self.save_queue().await;
    }

    async fn move_queue_item(&mut self, from: usize, to: usize) {
        if self.queue.move_item(from, to) {
            self.events.emit(PlaybackEvent::QueueChanged);
            self.prestage_next().await;
            self.save_queue().await;
        }
    }

    async fn set_shuffle(&mut self, mode: ShuffleMode) {
        if self.queue.set_shuffle(mode) {
            info!(target: "player::service", ?mode, "Shuffle mode changed");
            self.prestage_next().await;
            self.save_queue().await;
        }
    }

    async fn set_repeat(&mut self, mode: RepeatMode) {
        if self.queue.repeat() != mode {
            self.queue.set_repeat(mode);
            info!(target: "player::service", ?mode, "Repeat mode changed");
            self.prestage_next().await;
            self.save_queue().await;
        }
    }

    fn set_sleep_timer(&mut self, minutes: u32) {
        self.sleep_timer = None;
        self.sleep_minutes = minutes;
        if minutes > 0 {
            let delay = Duration::from_secs(u64::from(minutes) * 60);
            self.sleep_timer = Some(self.arm_timer(TimerKind::SleepTimer, delay));
            info!(target: "player::service", minutes, "Sleep timer armed");
        }
    }

    // ------------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------------

    fn play(&mut self) {
        if !self.player.is_initialized() {
            if self.status == PlaybackStatus::Opening {
                self.start_on_prepare = true;
            }
            return;
        }
        if !self.audio_session.request_focus() {
            debug!(target: "player::service", "Audio focus refused");
        }
        self.audio_session.register_media_buttons();
        self.player.start();
        self.status = PlaybackStatus::Playing;

        if !self.is_supposed_to_be_playing {
            self.is_supposed_to_be_playing = true;
            self.events
                .emit(PlaybackEvent::PlayStateChanged(self.now_playing()));
            self.restart_poller();
        }
    }

    async fn pause(&mut self) {
        if !self.player.is_initialized() || !self.is_supposed_to_be_playing {
            return;
        }
        self.player.pause();
        self.status = PlaybackStatus::Paused;
        self.is_supposed_to_be_playing = false;
        self.poller = None;
        self.events
            .emit(PlaybackEvent::PlayStateChanged(self.now_playing()));
        self.save_queue().await;
    }

    fn stop(&mut self) {
        self.paused_by_transient_loss = false;
        self.paused_by_connectivity = false;
        self.go_idle();
    }

    fn seek(&mut self, position: Duration) {
        if !self.player.is_initialized() {
            return;
        }
        let position = match self.player.duration() {
            Some(total) => position.min(total),
            None => position,
        };
        self.player.seek(position);
    }

    async fn previous(&mut self) {
        if self.queue.previous().is_some() {
            self.stop_playback();
            self.open_current(true).await;
            self.save_queue().await;
        }
    }

    /// Move to the next queue entry, or go idle at the end of the queue.
    async fn advance(&mut self, force: bool) {
        match self.queue.next_position(force) {
            Some(_) => {
                self.stop_playback();
                self.open_current(true).await;
                self.save_queue().await;
            }
            None => {
                debug!(target: "player::service", "End of queue");
                self.go_idle();
            }
        }
    }

    /// Release the current source without touching the playing intent.
    fn stop_playback(&mut self) {
        self.retry_timer = None;
        self.download = None;
        self.poller = None;
        self.network_guard = None;
        self.resume_seek = None;
        self.player.reset();
        self.status = PlaybackStatus::Stopped;
    }

    fn go_idle(&mut self) {
        self.stop_playback();
        if self.is_supposed_to_be_playing {
            self.is_supposed_to_be_playing = false;
            self.events
                .emit(PlaybackEvent::PlayStateChanged(self.now_playing()));
        }
    }

    /// Open the queue's current entry. Preparation completes later with a
    /// backend event.
    async fn open_current(&mut self, start_on_prepare: bool) {
        self.open_generation += 1;
        let Some(id) = self.queue.current() else {
            self.current = None;
            return;
        };

        let track = match self.store.get_track(id).await {
            Ok(Some(track)) => track,
            Ok(None) => {
                warn!(target: "player::service", id = %id, "Track no longer exists");
                self.current = None;
                self.on_open_failed().await;
                return;
            }
            Err(e) => {
                warn!(target: "player::service", id = %id, error = %e, "Failed to load track");
                self.current = None;
                self.on_open_failed().await;
                return;
            }
        };

        info!(target: "player::service", id = %id, uri = %track.uri, "Opening track");
        let remote = track.is_remote();
        let source = DataSource::from_uri(&track.uri);
        let downloadable = matches!(track.scheme().as_deref(), Some("http" | "https"));
        self.current = Some(track);
        self.start_on_prepare = start_on_prepare;
        self.status = PlaybackStatus::Opening;
        self.events.emit(PlaybackEvent::StartDialog);
        self.events.emit(PlaybackEvent::MetaChanged(self.now_playing()));

        if remote {
            self.network_guard = Some(self.wifi.guard());
        }

        if self.config.preferences.progressive_download
            && downloadable
            && let Some(downloader) = self.downloader.clone()
            && let DataSource::Remote(uri) = &source
        {
            let uri = uri.clone();
            let generation = self.open_generation;
            let tx = self.tx.clone();
            let guard = self.wifi.guard();
            self.download = Some(WorkerHandle::spawn(move |token| async move {
                let _guard = guard;
                let result = downloader
                    .download(&uri, &token)
                    .await
                    .map_err(|e| e.to_string());
                if !token.is_cancelled() {
                    let _ = tx.send(ServiceMessage::Downloaded { generation, result });
                }
            }));
            return;
        }

        self.player.set_data_source(source, None);
    }

    async fn on_downloaded(&mut self, generation: u64, result: std::result::Result<PathBuf, String>) {
        if generation != self.open_generation || self.download.take().is_none() {
            return;
        }
        match result {
            Ok(path) => self.player.set_data_source(DataSource::Local(path), None),
            Err(e) => {
                warn!(target: "player::service", error = %e, "Download failed");
                self.on_open_failed().await;
            }
        }
    }

    /// Hand the following entry to the backend for gapless playback.
    async fn prestage_next(&mut self) {
        if !self.player.is_initialized() {
            return;
        }
        let next = self
            .queue
            .peek_next()
            .filter(|i| Some(*i) != self.queue.position())
            .and_then(|i| self.queue.tracks().get(i).copied());
        let source = match next {
            Some(id) => match self.store.get_track(id).await {
                Ok(Some(track)) => Some(DataSource::from_uri(&track.uri)),
                _ => None,
            },
            None => None,
        };
        self.player.set_next_data_source(source.as_ref());
    }

    // ------------------------------------------------------------------------
    // Backend events
    // ------------------------------------------------------------------------

    async fn handle_player_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Prepared => self.on_prepared().await,
            PlayerEvent::Completed => self.on_completed().await,
            PlayerEvent::Error(PlayerErrorKind::ServerDied) => {
                if self.is_supposed_to_be_playing {
                    self.advance(true).await;
                } else {
                    self.stop_playback();
                    self.open_current(false).await;
                }
            }
            PlayerEvent::Error(PlayerErrorKind::Generic) => self.on_open_failed().await,
            PlayerEvent::MetadataUpdate => self.reload_current().await,
        }
    }

    async fn on_prepared(&mut self) {
        self.events.emit(PlaybackEvent::StopDialog);
        self.open_failures = 0;
        self.player.set_volume(self.fader.volume());

        if let Some(position) = self.resume_seek.take() {
            self.seek(position);
        }

        if self.start_on_prepare {
            let continuing = self.is_supposed_to_be_playing;
            self.play();
            if continuing {
                // New track while already playing: no play edge to restart on
                self.restart_poller();
            }
            self.events.emit(PlaybackEvent::MetaChanged(self.now_playing()));
            self.events
                .emit(PlaybackEvent::PlaybackStarted(self.now_playing()));
        } else {
            self.status = PlaybackStatus::Paused;
            self.events.emit(PlaybackEvent::MetaChanged(self.now_playing()));
        }
        self.prestage_next().await;
    }

    async fn on_completed(&mut self) {
        self.events
            .emit(PlaybackEvent::PlaybackComplete(self.now_playing()));
        if self.queue.repeat() == RepeatMode::Current {
            self.player.seek(Duration::ZERO);
            self.player.start();
            return;
        }
        self.advance(false).await;
    }

    /// A track failed to open. Skip ahead after a delay until every entry
    /// failed once in a row, then give up.
    async fn on_open_failed(&mut self) {
        self.events.emit(PlaybackEvent::StopDialog);
        self.open_failures += 1;
        if self.open_failures < self.queue.len() {
            let delay = Duration::from_millis(self.config.playback.retry_delay_ms);
            debug!(target: "player::service", failures = self.open_failures, ?delay, "Scheduling skip");
            self.retry_timer = Some(self.arm_timer(TimerKind::RetryNext, delay));
        } else {
            warn!(target: "player::service", failures = self.open_failures, "Every queue entry failed");
            self.open_failures = 0;
            self.go_idle();
            self.events.emit(PlaybackEvent::Error {
                code: ErrorCode::PlaybackFailed,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Focus, connectivity and remote commands
    // ------------------------------------------------------------------------

    fn handle_focus(&mut self, change: FocusChange) {
        debug!(target: "player::service", ?change, "Audio focus change");
        match change {
            FocusChange::Loss => {
                if self.is_supposed_to_be_playing {
                    self.paused_by_transient_loss = false;
                }
                self.pause_now();
            }
            FocusChange::LossTransient => {
                if self.is_supposed_to_be_playing {
                    self.paused_by_transient_loss = true;
                }
                self.pause_now();
            }
            FocusChange::LossTransientCanDuck => {
                if !self.config.platform.audio_ducking {
                    if self.is_supposed_to_be_playing {
                        self.paused_by_transient_loss = true;
                    }
                    self.pause_now();
                } else if self.is_supposed_to_be_playing {
                    if self.player.live_volume() {
                        self.fader.duck();
                        self.start_fade();
                    } else {
                        self.set_volume_now(DUCK_VOLUME);
                    }
                }
            }
            FocusChange::Gain => {
                let live = self.player.live_volume();
                if !self.is_supposed_to_be_playing && self.paused_by_transient_loss {
                    self.paused_by_transient_loss = false;
                    self.set_volume_now(if live { RESUME_VOLUME } else { FULL_VOLUME });
                    self.play();
                }
                if live {
                    self.fader.fade_up();
                    if self.fader.is_fading() {
                        self.start_fade();
                    }
                } else if self.fader.volume() != FULL_VOLUME {
                    self.set_volume_now(FULL_VOLUME);
                }
            }
        }
    }

    fn set_volume_now(&mut self, volume: f32) {
        self.fade_timer = None;
        self.fader.set_immediate(volume);
        self.player.set_volume(volume);
    }

    /// Pause without persisting; used from synchronous handlers.
    fn pause_now(&mut self) {
        if !self.player.is_initialized() || !self.is_supposed_to_be_playing {
            return;
        }
        self.player.pause();
        self.status = PlaybackStatus::Paused;
        self.is_supposed_to_be_playing = false;
        self.poller = None;
        self.events
            .emit(PlaybackEvent::PlayStateChanged(self.now_playing()));
    }

    fn handle_connectivity(&mut self, no_connectivity: bool, is_failover: bool, active_connected: bool) {
        match self
            .connectivity
            .on_change(no_connectivity, is_failover, active_connected)
        {
            Some(ConnectivityAction::Pause) => {
                info!(target: "player::service", "Connectivity lost");
                self.events
                    .emit(PlaybackEvent::ConnectivityChanged { connected: false });
                if self.is_supposed_to_be_playing {
                    self.pause_now();
                    self.paused_by_connectivity = true;
                }
            }
            Some(ConnectivityAction::TogglePause) => {
                info!(target: "player::service", "Connectivity restored");
                self.events
                    .emit(PlaybackEvent::ConnectivityChanged { connected: true });
                if self.paused_by_connectivity {
                    self.paused_by_connectivity = false;
                    self.play();
                }
            }
            None => {}
        }
    }

    async fn handle_remote(&mut self, command: RemoteCommand) {
        debug!(target: "player::service", ?command, "Remote command");
        match command {
            RemoteCommand::TogglePause => {
                self.clear_pause_causes();
                if self.is_supposed_to_be_playing {
                    self.pause().await;
                } else {
                    self.play();
                }
            }
            RemoteCommand::Pause => {
                self.clear_pause_causes();
                self.pause().await;
            }
            RemoteCommand::Stop => {
                self.clear_pause_causes();
                self.pause().await;
                self.seek(Duration::ZERO);
            }
            RemoteCommand::Previous => {
                let threshold = Duration::from_millis(self.config.playback.previous_restart_threshold_ms);
                if self.player.position().is_some_and(|p| p > threshold) {
                    self.seek(Duration::ZERO);
                    self.play();
                } else {
                    self.previous().await;
                }
            }
            RemoteCommand::Next => self.advance(true).await,
        }
    }

    fn clear_pause_causes(&mut self) {
        self.paused_by_transient_loss = false;
        self.paused_by_connectivity = false;
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn arm_timer(&mut self, kind: TimerKind, delay: Duration) -> (u64, WorkerHandle) {
        self.timer_seq += 1;
        let seq = self.timer_seq;
        let tx = self.tx.clone();
        let handle = WorkerHandle::spawn(move |token| async move {
            tokio::time::sleep(delay).await;
            if !token.is_cancelled() {
                let _ = tx.send(ServiceMessage::Timer(kind, seq));
            }
        });
        (seq, handle)
    }

    fn start_fade(&mut self) {
        if self.fade_timer.is_some() {
            return;
        }
        self.timer_seq += 1;
        let seq = self.timer_seq;
        let tx = self.tx.clone();
        let handle = WorkerHandle::spawn(move |token| async move {
            let mut ticker = tokio::time::interval(FADE_TICK);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if token.is_cancelled() || tx.send(ServiceMessage::Timer(TimerKind::Fade, seq)).is_err() {
                    break;
                }
            }
        });
        self.fade_timer = Some((seq, handle));
    }

    async fn handle_timer(&mut self, kind: TimerKind, seq: u64) {
        let slot = match kind {
            TimerKind::RetryNext => &mut self.retry_timer,
            TimerKind::SleepTimer => &mut self.sleep_timer,
            TimerKind::Fade => &mut self.fade_timer,
        };
        if !slot.as_ref().is_some_and(|(s, _)| *s == seq) {
            return;
        }

        match kind {
            TimerKind::RetryNext => {
                self.retry_timer = None;
                self.advance(true).await;
            }
            TimerKind::SleepTimer => {
                info!(target: "player::service", "Sleep timer fired");
                self.sleep_timer = None;
                self.sleep_minutes = 0;
                self.clear_pause_causes();
                self.pause().await;
            }
            TimerKind::Fade => match self.fader.tick() {
                Some(volume) => self.player.set_volume(volume),
                None => self.fade_timer = None,
            },
        }
    }

    // ------------------------------------------------------------------------
    // Metadata workers
    // ------------------------------------------------------------------------

    fn start_batch(&mut self, ids: Vec<TrackId>) {
        if !self.config.preferences.retrieve_metadata || ids.is_empty() {
            return;
        }
        let settings = BatchSettings {
            initial_delay: self.config.metadata.probe_initial_delay(),
            spacing: self.config.metadata.probe_spacing(),
            include_artwork: self.config.preferences.retrieve_album_art,
        };
        let store = Arc::clone(&self.store);
        let probe = Arc::clone(&self.track_probe);
        let locks = self.write_locks.clone();
        let tx = self.tx.clone();
        // Replacing the handle cancels the previous batch
        self.batch = Some(WorkerHandle::spawn(move |token| async move {
            run_batch(ids, store, probe, locks, settings, token, move |retrieved| {
                let _ = tx.send(ServiceMessage::MetadataRetrieved(retrieved));
            })
            .await;
        }));
    }

    fn restart_poller(&mut self) {
        self.poller = None;
        if !self.config.preferences.retrieve_shoutcast_metadata {
            return;
        }
        let Some(track) = &self.current else {
            return;
        };
        if !matches!(track.scheme().as_deref(), Some("http" | "https")) {
            return;
        }

        let id = track.id;
        let uri = track.uri.clone();
        let source = Arc::clone(&self.stream_source);
        let store = Arc::clone(&self.store);
        let locks = self.write_locks.clone();
        let interval = self.config.metadata.poll_interval();
        let tx = self.tx.clone();
        let handle = WorkerHandle::spawn(move |token| async move {
            run_poller(id, uri, source, store, locks, interval, token, move |event| {
                let _ = tx.send(ServiceMessage::Poller(event));
            })
            .await;
        });
        self.poller = Some((id, handle));
    }

    async fn on_metadata_retrieved(&mut self, retrieved: Retrieved) {
        self.events
            .emit(PlaybackEvent::MetaRetrieved { id: retrieved.id });
        if retrieved.artwork {
            self.events
                .emit(PlaybackEvent::ArtChanged { id: retrieved.id });
        }
        if self.current.as_ref().is_some_and(|t| t.id == retrieved.id) {
            self.reload_current().await;
        }
    }

    async fn on_poller_event(&mut self, event: PollerEvent) {
        match event {
            PollerEvent::Updated(id) => {
                if self.current.as_ref().is_some_and(|t| t.id == id) {
                    self.reload_current().await;
                }
            }
            PollerEvent::Stopped(id) => {
                if self.poller.as_ref().is_some_and(|(p, _)| *p == id) {
                    self.poller = None;
                }
            }
        }
    }

    /// Re-read the current track's row and announce its new tags.
    async fn reload_current(&mut self) {
        let Some(id) = self.current.as_ref().map(|t| t.id) else {
            return;
        };
        match self.store.get_track(id).await {
            Ok(Some(track)) => {
                self.current = Some(track);
                self.events.emit(PlaybackEvent::MetaChanged(self.now_playing()));
            }
            Ok(None) => {}
            Err(e) => warn!(target: "player::service", id = %id, error = %e, "Failed to reload track"),
        }
    }

    // ------------------------------------------------------------------------
    // Preferences, persistence and lifecycle
    // ------------------------------------------------------------------------

    fn apply_preferences(&mut self, preferences: Preferences) {
        info!(target: "player::service", "Preferences changed");
        self.wifi.set_wanted(preferences.wifi_lock);
        self.player.set_prefer_demuxer(preferences.use_alternate_backend);
        if !preferences.retrieve_shoutcast_metadata {
            self.poller = None;
        }
        if !preferences.retrieve_metadata {
            self.batch = None;
        }
        self.config.preferences = preferences;
    }

    async fn save_queue(&mut self) {
        let seek_ms = self
            .player
            .position()
            .map(|p| p.as_millis() as u64)
            .unwrap_or_default();
        if let Err(e) = self.store.save_snapshot(&self.queue.snapshot(seek_ms)).await {
            warn!(target: "player::service", error = %e, "Failed to save queue");
        }
    }

    /// Load the persisted queue, drop entries that no longer resolve and
    /// re-arm the current track without starting it.
    pub async fn restore(&mut self) {
        let snapshot = match self.store.load_snapshot().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return,
            Err(e) => {
                warn!(target: "player::service", error = %e, "Failed to load saved queue");
                return;
            }
        };

        self.queue = PlayQueue::from_snapshot(&snapshot);
        let resolvable: HashSet<TrackId> = match self.store.get_tracks(self.queue.tracks()).await {
            Ok(tracks) => tracks.into_iter().map(|t| t.id).collect(),
            Err(e) => {
                warn!(target: "player::service", error = %e, "Failed to resolve saved queue");
                return;
            }
        };
        let outcome = self.queue.retain_resolvable(&resolvable);
        info!(
            target: "player::service",
            tracks = self.queue.len(),
            dropped = outcome.removed,
            "Restored queue"
        );
        if outcome.removed > 0 {
            self.events.emit(PlaybackEvent::QueueChanged);
            self.save_queue().await;
        }

        if self.queue.current().is_some() {
            self.open_current(false).await;
            if !outcome.current_removed && snapshot.seek_position_ms > 0 {
                self.resume_seek = Some(Duration::from_millis(snapshot.seek_position_ms));
            }
        }
    }

    async fn shutdown(&mut self) {
        info!(target: "player::service", "Shutting down");
        self.save_queue().await;
        self.batch = None;
        self.poller = None;
        self.download = None;
        self.sleep_timer = None;
        self.retry_timer = None;
        self.fade_timer = None;
        self.network_guard = None;
        self.player.release();
        self.is_supposed_to_be_playing = false;
        self.status = PlaybackStatus::Stopped;
        self.sync_keep_awake();
        self.audio_session.abandon_focus();
        self.audio_session.unregister_media_buttons();
        self.events.emit(PlaybackEvent::PlayerClosed);
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Cloneable remote control for a running [`PlaybackService`].
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<ServiceMessage>,
    events: EventBus,
}

impl PlaybackHandle {
    fn send(&self, msg: ServiceMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::ServiceClosed)
    }

    fn request(&self, request: Request) -> Result<()> {
        self.send(ServiceMessage::Request(request))
    }

    async fn status(&self) -> Result<PlayerStatus> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Status(reply))?;
        rx.await.map_err(|_| Error::ServiceClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    /// A handle that does not keep the service reachable.
    pub fn downgrade(&self) -> WeakPlaybackHandle {
        WeakPlaybackHandle {
            tx: self.tx.downgrade(),
            events: self.events.clone(),
        }
    }

    /// Post a raw message, as host integrations (focus, network) do.
    pub fn post(&self, msg: ServiceMessage) -> Result<()> {
        self.send(msg)
    }

    pub fn open(&self, ids: Vec<TrackId>, position: Option<usize>) -> Result<()> {
        self.request(Request::Open { ids, position })
    }

    pub fn enqueue(&self, ids: Vec<TrackId>, action: EnqueueAction) -> Result<()> {
        self.request(Request::Enqueue { ids, action })
    }

    pub fn play(&self) -> Result<()> {
        self.request(Request::Play)
    }

    pub fn pause(&self) -> Result<()> {
        self.request(Request::Pause)
    }

    pub fn stop(&self) -> Result<()> {
        self.request(Request::Stop)
    }

    pub fn prev(&self) -> Result<()> {
        self.request(Request::Previous)
    }

    pub fn next(&self) -> Result<()> {
        self.request(Request::Next)
    }

    pub fn seek(&self, position: Duration) -> Result<()> {
        self.request(Request::Seek(position))
    }

    pub fn set_queue_position(&self, index: usize) -> Result<()> {
        self.request(Request::SetQueuePosition(index))
    }

    pub async fn remove_tracks(&self, first: usize, last: usize) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::RemoveTracks { first, last, reply })?;
        rx.await.map_err(|_| Error::ServiceClosed)
    }

    pub async fn remove_track(&self, id: TrackId) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::RemoveTrack { id, reply })?;
        rx.await.map_err(|_| Error::ServiceClosed)
    }

    pub fn move_queue_item(&self, from: usize, to: usize) -> Result<()> {
        self.request(Request::MoveQueueItem { from, to })
    }

    pub fn set_shuffle_mode(&self, mode: ShuffleMode) -> Result<()> {
        self.request(Request::SetShuffle(mode))
    }

    pub fn set_repeat_mode(&self, mode: RepeatMode) -> Result<()> {
        self.request(Request::SetRepeat(mode))
    }

    /// Pause after `minutes`; 0 turns the timer off.
    pub fn set_sleep_timer(&self, minutes: u32) -> Result<()> {
        self.request(Request::SetSleepTimer(minutes))
    }

    pub fn remote(&self, command: RemoteCommand) -> Result<()> {
        self.send(ServiceMessage::Remote(command))
    }

    pub async fn queue(&self) -> Result<Vec<TrackId>> {
        Ok(self.status().await?.queue)
    }

    pub async fn queue_position(&self) -> Result<Option<usize>> {
        Ok(self.status().await?.queue_position)
    }

    pub async fn now_playing(&self) -> Result<NowPlaying> {
        Ok(self.status().await?.now_playing)
    }

    pub async fn is_playing(&self) -> Result<bool> {
        Ok(self.status().await?.playing)
    }

    pub async fn position(&self) -> Result<Option<Duration>> {
        Ok(self.status().await?.position)
    }

    pub async fn duration(&self) -> Result<Option<Duration>> {
        Ok(self.status().await?.duration)
    }

    pub async fn shuffle_mode(&self) -> Result<ShuffleMode> {
        Ok(self.status().await?.shuffle)
    }

    pub async fn repeat_mode(&self) -> Result<RepeatMode> {
        Ok(self.status().await?.repeat)
    }

    pub async fn sleep_timer(&self) -> Result<u32> {
        Ok(self.status().await?.sleep_minutes)
    }

    pub async fn player_status(&self) -> Result<PlayerStatus> {
        self.status().await
    }

    /// Save, release everything and stop the service loop.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ServiceMessage::Shutdown(reply))?;
        rx.await.map_err(|_| Error::ServiceClosed)
    }
}

/// Lookup-only reference to the service.
#[derive(Debug, Clone)]
pub struct WeakPlaybackHandle {
    tx: mpsc::WeakUnboundedSender<ServiceMessage>,
    events: EventBus,
}

impl WeakPlaybackHandle {
    /// `None` once the service has stopped.
    pub fn upgrade(&self) -> Option<PlaybackHandle> {
        let tx = self.tx.upgrade().filter(|tx| !tx.is_closed())?;
        Some(PlaybackHandle {
            tx,
            events: self.events.clone(),
        })
    }
}
