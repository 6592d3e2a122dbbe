//! Test utilities and fixtures for ServeStream tests.
//!
//! This module provides common test helpers, in-memory stores and
//! recording fakes for every seam of the playback core, so tests can drive
//! the service without audio hardware, a network or a database file.
//!
//! # Example
//!
//! ```ignore
//! use servestream::test_utils::{FakeBackends, MemoryTrackStore};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let store = MemoryTrackStore::new();
//!     let id = store.insert("/music/a.mp3");
//!     let backends = FakeBackends::new();
//!     // ... test logic
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePool;
use tempfile::TempDir;

use crate::db::TrackStore;
use crate::error::{Error, Result};
use crate::metadata::batch::TrackProbe;
use crate::metadata::poller::StreamMetadataSource;
use crate::metadata::{MetadataError, TrackMetadata};
use crate::model::{Track, TrackId, TrackUpdate};
use crate::net::ContentTypeProbe;
use crate::player::backend::{
    BackendError, BackendEvent, BackendFactory, BackendKind, DataSource, EventSink, PlayerBackend,
};
use crate::player::connectivity::WifiLock;
use crate::player::focus::AudioSession;
use crate::player::queue::QueueSnapshot;

/// Creates a temporary database for testing.
///
/// The database is created in a temporary directory that is automatically
/// cleaned up when the returned `TempDir` is dropped. Migrations are run
/// automatically.
///
/// # Returns
///
/// A tuple of (connection pool, temp directory handle).
/// Keep the TempDir alive for the duration of your test.
pub async fn temp_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let db_path = dir.path().join("test.db");
    let db_url = format!("sqlite:{}", db_path.display());

    let pool = crate::db::init_db(&db_url)
        .await
        .expect("Failed to initialize test database");

    (pool, dir)
}

/// An untagged track row.
pub fn track(id: i64, uri: &str) -> Track {
    Track {
        id: TrackId(id),
        uri: uri.to_string(),
        title: None,
        album: None,
        artist: None,
        duration_ms: None,
        artwork: None,
    }
}

/// A silent mono 16-bit PCM WAV file.
pub fn wav_bytes(sample_rate: u32, n_samples: u32) -> Vec<u8> {
    let data_len = n_samples * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.resize(44 + data_len as usize, 0);
    out
}

// ============================================================================
// Track store
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    tracks: Vec<Track>,
    snapshot: Option<QueueSnapshot>,
    snapshot_saves: usize,
}

/// In-memory [`TrackStore`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryTrackStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTrackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an untagged row and return its id (starting at 1).
    pub fn insert(&self, uri: &str) -> TrackId {
        let mut state = self.state.lock();
        let id = state.tracks.len() as i64 + 1;
        state.tracks.push(track(id, uri));
        TrackId(id)
    }

    pub fn track(&self, id: TrackId) -> Option<Track> {
        self.state.lock().tracks.iter().find(|t| t.id == id).cloned()
    }

    /// Seed a persisted queue as if a previous session saved it.
    pub fn save_snapshot_now(&self, snapshot: QueueSnapshot) {
        self.state.lock().snapshot = Some(snapshot);
    }

    pub fn snapshot(&self) -> Option<QueueSnapshot> {
        self.state.lock().snapshot.clone()
    }

    pub fn snapshot_saves(&self) -> usize {
        self.state.lock().snapshot_saves
    }
}

#[async_trait]
impl TrackStore for MemoryTrackStore {
    async fn get_track(&self, id: TrackId) -> Result<Option<Track>> {
        Ok(self.track(id))
    }

    async fn insert_track(&self, uri: &str) -> Result<TrackId> {
        Ok(self.insert(uri))
    }

    async fn get_tracks(&self, ids: &[TrackId]) -> Result<Vec<Track>> {
        Ok(ids.iter().filter_map(|id| self.track(*id)).collect())
    }

    async fn update_track(&self, id: TrackId, update: &TrackUpdate) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(track) = state.tracks.iter_mut().find(|t| t.id == id) else {
            return Ok(false);
        };
        if let Some(title) = &update.title {
            track.title = Some(title.clone());
        }
        if let Some(album) = &update.album {
            track.album = Some(album.clone());
        }
        if let Some(artist) = &update.artist {
            track.artist = Some(artist.clone());
        }
        if let Some(ms) = update.duration_ms {
            track.duration_ms = Some(ms);
        }
        if let Some(artwork) = &update.artwork {
            track.artwork = Some(artwork.clone());
        }
        Ok(true)
    }

    async fn load_snapshot(&self) -> Result<Option<QueueSnapshot>> {
        Ok(self.snapshot())
    }

    async fn save_snapshot(&self, snapshot: &QueueSnapshot) -> Result<()> {
        let mut state = self.state.lock();
        state.snapshot = Some(snapshot.clone());
        state.snapshot_saves += 1;
        Ok(())
    }
}

// ============================================================================
// Player backends
// ============================================================================

/// Duration every fake backend reports once prepared.
pub const FAKE_DURATION: Duration = Duration::from_secs(180);

/// One call made on a fake backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    SetDataSource(DataSource),
    Prepare,
    Start,
    Pause,
    Reset,
    Seek(Duration),
    Release,
    Volume(f32),
    NextSource(Option<DataSource>),
}

#[derive(Default)]
struct FakeState {
    created: Vec<BackendKind>,
    calls: Vec<(u64, BackendKind, BackendCall)>,
    sinks: HashMap<u64, EventSink>,
    kinds: HashMap<u64, BackendKind>,
    // Survives clear_calls
    current: Option<u64>,
    fixed_volume: bool,
    fail_set_data_source: bool,
}

/// Records every backend call and lets tests inject backend events.
///
/// Clones share state; hand [`FakeBackends::factory`] to the code under test
/// and keep a clone for assertions.
#[derive(Clone, Default)]
pub struct FakeBackends {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Box<dyn BackendFactory> {
        Box::new(self.clone())
    }

    /// Kinds in creation order.
    pub fn created(&self) -> Vec<BackendKind> {
        self.state.lock().created.clone()
    }

    /// Calls on every instance of `kind`, in order.
    pub fn calls_for(&self, kind: BackendKind) -> Vec<BackendCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, c)| c.clone())
            .collect()
    }

    pub fn calls_for_instance(&self, instance: u64) -> Vec<BackendCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(i, _, _)| *i == instance)
            .map(|(_, _, c)| c.clone())
            .collect()
    }

    pub fn all_calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.iter().map(|(_, _, c)| c.clone()).collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Latest instance created for `kind`.
    pub fn instance_of(&self, kind: BackendKind) -> Option<u64> {
        let state = self.state.lock();
        state
            .kinds
            .iter()
            .filter(|(_, k)| **k == kind)
            .map(|(i, _)| *i)
            .max()
    }

    /// Instance that was most recently given a data source.
    pub fn current_instance(&self) -> Option<u64> {
        self.state.lock().current
    }

    /// Most recent data source handed to any backend.
    pub fn last_source(&self) -> Option<DataSource> {
        self.state
            .lock()
            .calls
            .iter()
            .rev()
            .find_map(|(_, _, c)| match c {
                BackendCall::SetDataSource(source) => Some(source.clone()),
                _ => None,
            })
    }

    /// Make backends report that volume changes need an output restart.
    pub fn fixed_volume(&self, fixed: bool) {
        self.state.lock().fixed_volume = fixed;
    }

    pub fn fail_set_data_source(&self, fail: bool) {
        self.state.lock().fail_set_data_source = fail;
    }

    /// Fire `event` from a specific instance.
    pub fn emit(&self, instance: u64, event: BackendEvent) {
        let sink = self.state.lock().sinks.get(&instance).cloned();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    /// Fire `event` from the instance holding the current data source.
    pub fn emit_current(&self, event: BackendEvent) {
        if let Some(instance) = self.current_instance() {
            self.emit(instance, event);
        }
    }
}

impl BackendFactory for FakeBackends {
    fn create(&mut self, kind: BackendKind, events: EventSink) -> Box<dyn PlayerBackend> {
        let instance = events.instance();
        let mut state = self.state.lock();
        state.created.push(kind);
        state.kinds.insert(instance, kind);
        state.sinks.insert(instance, events);
        Box::new(FakeBackend {
            kind,
            instance,
            shared: Arc::clone(&self.state),
            prepared: false,
            position: Duration::ZERO,
        })
    }
}

struct FakeBackend {
    kind: BackendKind,
    instance: u64,
    shared: Arc<Mutex<FakeState>>,
    prepared: bool,
    position: Duration,
}

impl FakeBackend {
    fn record(&self, call: BackendCall) {
        self.shared.lock().calls.push((self.instance, self.kind, call));
    }
}

impl PlayerBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn set_data_source(&mut self, source: &DataSource) -> std::result::Result<(), BackendError> {
        self.record(BackendCall::SetDataSource(source.clone()));
        let fail = {
            let mut shared = self.shared.lock();
            shared.current = Some(self.instance);
            shared.fail_set_data_source
        };
        if fail {
            return Err(BackendError::InvalidSource(source.as_arg()));
        }
        self.prepared = false;
        self.position = Duration::ZERO;
        Ok(())
    }

    fn prepare_async(&mut self) -> std::result::Result<(), BackendError> {
        self.record(BackendCall::Prepare);
        self.prepared = true;
        Ok(())
    }

    fn start(&mut self) -> std::result::Result<(), BackendError> {
        self.record(BackendCall::Start);
        Ok(())
    }

    fn pause(&mut self) -> std::result::Result<(), BackendError> {
        self.record(BackendCall::Pause);
        Ok(())
    }

    fn reset(&mut self) {
        self.record(BackendCall::Reset);
        self.prepared = false;
        self.position = Duration::ZERO;
    }

    fn seek(&mut self, position: Duration) -> std::result::Result<(), BackendError> {
        self.record(BackendCall::Seek(position));
        self.position = position;
        Ok(())
    }

    fn release(&mut self) {
        self.record(BackendCall::Release);
    }

    fn duration(&self) -> Option<Duration> {
        self.prepared.then_some(FAKE_DURATION)
    }

    fn position(&self) -> Duration {
        self.position
    }

    fn set_volume(&mut self, volume: f32) {
        self.record(BackendCall::Volume(volume));
    }

    fn live_volume(&self) -> bool {
        !self.shared.lock().fixed_volume
    }

    fn set_next_data_source(&mut self, source: Option<&DataSource>) -> std::result::Result<(), BackendError> {
        self.record(BackendCall::NextSource(source.cloned()));
        Ok(())
    }
}

// ============================================================================
// Mocks
// ============================================================================

/// Scripted content-type lookups.
#[derive(Debug, Clone)]
pub struct MockContentTypeProbe {
    answer: std::result::Result<Option<String>, String>,
}

impl MockContentTypeProbe {
    /// The server sends no content type.
    pub fn none() -> Self {
        Self { answer: Ok(None) }
    }

    pub fn returning(content_type: &str) -> Self {
        Self {
            answer: Ok(Some(content_type.to_string())),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: Err("connection refused".to_string()),
        }
    }
}

#[async_trait]
impl ContentTypeProbe for MockContentTypeProbe {
    async fn content_type(&self, _uri: &str) -> Result<Option<String>> {
        self.answer.clone().map_err(Error::network)
    }
}

/// Tag probe answering from a fixed table. Unknown URIs yield no tags.
#[derive(Debug, Clone, Default)]
pub struct MockTrackProbe {
    answers: HashMap<String, Option<TrackMetadata>>,
    calls: Arc<AtomicUsize>,
}

impl MockTrackProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, uri: &str, metadata: TrackMetadata) -> Self {
        self.answers.insert(uri.to_string(), Some(metadata));
        self
    }

    pub fn failing(mut self, uri: &str) -> Self {
        self.answers.insert(uri.to_string(), None);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrackProbe for MockTrackProbe {
    async fn probe(&self, track: &Track) -> std::result::Result<TrackMetadata, MetadataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.answers.get(&track.uri) {
            Some(Some(metadata)) => Ok(metadata.clone()),
            Some(None) => Err(MetadataError::Network("unreachable".to_string())),
            None => Ok(TrackMetadata::default()),
        }
    }
}

/// Stream title source that replays a script, then reports no title.
#[derive(Debug, Clone)]
pub struct MockStreamSource {
    script: Arc<Vec<Option<String>>>,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl MockStreamSource {
    pub fn scripted<const N: usize>(script: [Option<&str>; N]) -> Self {
        Self {
            script: Arc::new(script.iter().map(|s| s.map(str::to_string)).collect()),
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            script: Arc::new(Vec::new()),
            fail: true,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamMetadataSource for MockStreamSource {
    async fn fetch_title(&self, _uri: &str) -> std::result::Result<Option<String>, MetadataError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(MetadataError::Network("connection reset".to_string()));
        }
        Ok(self.script.get(n).cloned().flatten())
    }
}

#[derive(Debug, Default)]
struct SessionState {
    deny: bool,
    focus_requests: usize,
    focus_abandoned: usize,
    buttons_registered: bool,
    awake: bool,
}

/// Audio session that counts focus traffic.
#[derive(Debug, Clone, Default)]
pub struct RecordingAudioSession {
    state: Arc<Mutex<SessionState>>,
}

impl RecordingAudioSession {
    /// A session whose focus requests are refused.
    pub fn denying() -> Self {
        let session = Self::default();
        session.state.lock().deny = true;
        session
    }

    pub fn focus_requests(&self) -> usize {
        self.state.lock().focus_requests
    }

    pub fn focus_abandoned(&self) -> usize {
        self.state.lock().focus_abandoned
    }

    pub fn buttons_registered(&self) -> bool {
        self.state.lock().buttons_registered
    }

    pub fn kept_awake(&self) -> bool {
        self.state.lock().awake
    }
}

impl AudioSession for RecordingAudioSession {
    fn request_focus(&mut self) -> bool {
        let mut state = self.state.lock();
        state.focus_requests += 1;
        !state.deny
    }

    fn abandon_focus(&mut self) {
        self.state.lock().focus_abandoned += 1;
    }

    fn register_media_buttons(&mut self) {
        self.state.lock().buttons_registered = true;
    }

    fn unregister_media_buttons(&mut self) {
        self.state.lock().buttons_registered = false;
    }

    fn set_keep_awake(&mut self, awake: bool) {
        self.state.lock().awake = awake;
    }
}

#[derive(Debug, Default)]
struct WifiState {
    held: bool,
    acquired: usize,
    released: usize,
    last_high_perf: Option<bool>,
}

/// Wi-Fi lock that records acquire/release traffic.
#[derive(Debug, Clone, Default)]
pub struct RecordingWifiLock {
    state: Arc<Mutex<WifiState>>,
}

impl RecordingWifiLock {
    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }

    pub fn acquired(&self) -> usize {
        self.state.lock().acquired
    }

    pub fn released(&self) -> usize {
        self.state.lock().released
    }

    pub fn last_high_perf(&self) -> Option<bool> {
        self.state.lock().last_high_perf
    }
}

impl WifiLock for RecordingWifiLock {
    fn acquire(&mut self, high_perf: bool) {
        let mut state = self.state.lock();
        state.held = true;
        state.acquired += 1;
        state.last_high_perf = Some(high_perf);
    }

    fn release(&mut self) {
        let mut state = self.state.lock();
        state.held = false;
        state.released += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_instance_survives_clear_calls() {
        let mut backends = FakeBackends::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_log = Arc::clone(&received);
        let sink = EventSink::new(
            7,
            Arc::new(move |instance, event| sink_log.lock().push((instance, event))),
        );
        let mut backend = backends.create(BackendKind::Buffered, sink);
        backend
            .set_data_source(&DataSource::from_uri("/music/a.mp3"))
            .unwrap();

        backends.clear_calls();
        assert!(backends.all_calls().is_empty());
        assert_eq!(backends.current_instance(), Some(7));

        backends.emit_current(BackendEvent::Completed);
        assert_eq!(received.lock().len(), 1);
        assert_eq!(received.lock()[0].0, 7);
    }
}
