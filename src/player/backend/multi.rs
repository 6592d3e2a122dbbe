//! Backend selector wrapping the three backend kinds behind one interface.
//!
//! `MultiPlayer` owns lazily created instances of each [`BackendKind`],
//! routes a data source to the right one, and normalizes their raw events
//! into [`PlayerEvent`]s. Every failure is delivered as an event on the same
//! channel as normal lifecycle events; nothing here returns an error to the
//! state machine.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{
    BackendEvent, BackendFactory, BackendKind, DataSource, EventSink, MEDIA_ERROR_SERVER_DIED,
    MEDIA_ERROR_UNKNOWN, MEDIA_INFO_METADATA_UPDATE, PlayerBackend, rewrite_for_content_type,
    select_backend,
};
use crate::net::ContentTypeProbe;
use crate::task::WorkerHandle;

/// Raw signals the selector needs delivered back on the owner's thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiSignal {
    Backend { instance: u64, event: BackendEvent },
    ContentType { request: u64, content_type: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerErrorKind {
    /// Data source or playback failure; the same backend stays usable
    Generic,
    /// The backend instance died and was replaced
    ServerDied,
}

/// Normalized backend events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEvent {
    Prepared,
    Completed,
    Error(PlayerErrorKind),
    MetadataUpdate,
}

struct Slot {
    instance: u64,
    backend: Box<dyn PlayerBackend>,
}

struct PendingProbe {
    request: u64,
    uri: String,
    _worker: WorkerHandle,
}

pub struct MultiPlayer {
    factory: Box<dyn BackendFactory>,
    probe: Arc<dyn ContentTypeProbe>,
    notify: Arc<dyn Fn(MultiSignal) + Send + Sync>,
    backend_sink: Arc<dyn Fn(u64, BackendEvent) + Send + Sync>,
    slots: [Option<Slot>; 3],
    active: Option<BackendKind>,
    initialized: bool,
    prefer_demuxer: bool,
    next_instance: u64,
    next_request: u64,
    pending_probe: Option<PendingProbe>,
}

impl MultiPlayer {
    /// Create the selector with a ready native backend.
    pub fn new(
        factory: Box<dyn BackendFactory>,
        probe: Arc<dyn ContentTypeProbe>,
        notify: Arc<dyn Fn(MultiSignal) + Send + Sync>,
        prefer_demuxer: bool,
    ) -> Self {
        let forward = Arc::clone(&notify);
        let backend_sink: Arc<dyn Fn(u64, BackendEvent) + Send + Sync> =
            Arc::new(move |instance, event| forward(MultiSignal::Backend { instance, event }));
        let mut player = Self {
            factory,
            probe,
            notify,
            backend_sink,
            slots: [None, None, None],
            active: None,
            initialized: false,
            prefer_demuxer,
            next_instance: 1,
            next_request: 1,
            pending_probe: None,
        };
        player.ensure_slot(BackendKind::Native);
        player
    }

    /// Route remote playback to the demuxer regardless of scheme.
    pub fn set_prefer_demuxer(&mut self, prefer: bool) {
        self.prefer_demuxer = prefer;
    }

    /// The backend finished preparing the current source.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn active_kind(&self) -> Option<BackendKind> {
        self.active
    }

    /// Start opening `source`. Completion arrives as a [`PlayerEvent`].
    ///
    /// Remote HTTP sources with an unknown content type are probed first;
    /// a failed probe continues with an empty content type.
    pub fn set_data_source(&mut self, source: DataSource, content_type: Option<String>) {
        self.reset();

        if let DataSource::Remote(uri) = &source
            && content_type.is_none()
            && matches!(source.scheme().as_deref(), Some("http" | "https"))
        {
            let request = self.next_request;
            self.next_request += 1;
            let probe = Arc::clone(&self.probe);
            let notify = Arc::clone(&self.notify);
            let target = uri.clone();
            debug!(target: "player::backend", uri = %uri, request, "Probing content type");
            let worker = WorkerHandle::spawn(move |token| async move {
                let content_type = match probe.content_type(&target).await {
                    Ok(ct) => ct.unwrap_or_default(),
                    Err(e) => {
                        debug!(target: "player::backend", uri = %target, error = %e, "Content type probe failed");
                        String::new()
                    }
                };
                if !token.is_cancelled() {
                    notify(MultiSignal::ContentType {
                        request,
                        content_type,
                    });
                }
            });
            self.pending_probe = Some(PendingProbe {
                request,
                uri: uri.clone(),
                _worker: worker,
            });
            return;
        }

        self.open_with(source, content_type.as_deref().unwrap_or_default());
    }

    /// Continue an open once the content type probe answered.
    pub fn on_content_type(&mut self, request: u64, content_type: &str) {
        match self.pending_probe.take() {
            Some(pending) if pending.request == request => {
                debug!(target: "player::backend", uri = %pending.uri, content_type, "Content type resolved");
                self.open_with(DataSource::Remote(pending.uri), content_type);
            }
            other => {
                debug!(target: "player::backend", request, "Dropping stale content type answer");
                self.pending_probe = other;
            }
        }
    }

    fn open_with(&mut self, source: DataSource, content_type: &str) {
        let source = match source {
            DataSource::Remote(uri) => DataSource::Remote(rewrite_for_content_type(&uri, content_type)),
            local => local,
        };
        let kind = select_backend(
            source.scheme().as_deref(),
            (!content_type.is_empty()).then_some(content_type),
            source.is_local(),
            self.prefer_demuxer,
        );
        info!(target: "player::backend", ?kind, source = %source.as_arg(), "Opening data source");

        self.active = Some(kind);
        self.initialized = false;
        let slot = self.ensure_slot(kind);
        let instance = slot.instance;
        let result = slot
            .backend
            .set_data_source(&source)
            .and_then(|_| slot.backend.prepare_async());

        if let Err(e) = result {
            warn!(target: "player::backend", ?kind, error = %e, "Failed to set data source");
            self.initialized = false;
            self.post_error(instance, MEDIA_ERROR_UNKNOWN);
        }
    }

    /// Normalize a raw backend event. Events from instances other than the
    /// active one are dropped.
    pub fn handle_backend_event(&mut self, instance: u64, event: BackendEvent) -> Option<PlayerEvent> {
        if !self.is_active_instance(instance) {
            debug!(target: "player::backend", instance, ?event, "Ignoring event from inactive backend");
            return None;
        }
        match event {
            BackendEvent::Prepared => {
                self.initialized = true;
                Some(PlayerEvent::Prepared)
            }
            BackendEvent::Completed => self.initialized.then_some(PlayerEvent::Completed),
            BackendEvent::Error {
                what: MEDIA_ERROR_SERVER_DIED,
                ..
            } => {
                warn!(target: "player::backend", instance, "Backend died, rebuilding");
                self.release();
                self.ensure_slot(BackendKind::Native);
                Some(PlayerEvent::Error(PlayerErrorKind::ServerDied))
            }
            BackendEvent::Error { what, extra } => {
                warn!(target: "player::backend", instance, what, extra, "Backend error");
                self.initialized = false;
                Some(PlayerEvent::Error(PlayerErrorKind::Generic))
            }
            BackendEvent::Info {
                what: MEDIA_INFO_METADATA_UPDATE,
                ..
            } => Some(PlayerEvent::MetadataUpdate),
            BackendEvent::Info { .. } => None,
        }
    }

    pub fn start(&mut self) {
        self.control(|b| b.start());
    }

    pub fn pause(&mut self) {
        self.control(|b| b.pause());
    }

    pub fn seek(&mut self, position: Duration) {
        self.control(|b| b.seek(position));
    }

    /// Stop the active backend and forget its source.
    pub fn reset(&mut self) {
        self.pending_probe = None;
        if let Some(slot) = self.active_slot_mut() {
            slot.backend.reset();
        }
        self.active = None;
        self.initialized = false;
    }

    /// Release every instance.
    pub fn release(&mut self) {
        self.pending_probe = None;
        for slot in self.slots.iter_mut() {
            if let Some(mut slot) = slot.take() {
                slot.backend.release();
            }
        }
        self.active = None;
        self.initialized = false;
    }

    pub fn set_volume(&mut self, volume: f32) {
        for slot in self.slots.iter_mut().flatten() {
            slot.backend.set_volume(volume);
        }
    }

    /// True unless the active backend can only apply volume by restarting.
    pub fn live_volume(&self) -> bool {
        self.active_slot().is_none_or(|s| s.backend.live_volume())
    }

    pub fn duration(&self) -> Option<Duration> {
        if !self.initialized {
            return None;
        }
        self.active_slot().and_then(|s| s.backend.duration())
    }

    pub fn position(&self) -> Option<Duration> {
        if !self.initialized {
            return None;
        }
        self.active_slot().map(|s| s.backend.position())
    }

    /// Best-effort handoff of the following source; failures are ignored.
    pub fn set_next_data_source(&mut self, source: Option<&DataSource>) {
        if !self.initialized {
            return;
        }
        if let Some(slot) = self.active_slot_mut()
            && let Err(e) = slot.backend.set_next_data_source(source)
        {
            debug!(target: "player::backend", error = %e, "Next data source not staged");
        }
    }

    fn control(&mut self, f: impl FnOnce(&mut dyn PlayerBackend) -> Result<(), super::BackendError>) {
        if !self.initialized {
            return;
        }
        let Some(slot) = self.active_slot_mut() else {
            return;
        };
        let instance = slot.instance;
        if let Err(e) = f(slot.backend.as_mut()) {
            warn!(target: "player::backend", error = %e, "Backend control failed");
            self.initialized = false;
            self.post_error(instance, MEDIA_ERROR_UNKNOWN);
        }
    }

    fn post_error(&self, instance: u64, what: i32) {
        (self.notify)(MultiSignal::Backend {
            instance,
            event: BackendEvent::Error { what, extra: 0 },
        });
    }

    fn ensure_slot(&mut self, kind: BackendKind) -> &mut Slot {
        let factory = &mut self.factory;
        let next_instance = &mut self.next_instance;
        let sink = &self.backend_sink;
        self.slots[kind.slot()].get_or_insert_with(|| {
            let instance = *next_instance;
            *next_instance += 1;
            debug!(target: "player::backend", ?kind, instance, "Creating backend");
            Slot {
                instance,
                backend: factory.create(kind, EventSink::new(instance, Arc::clone(sink))),
            }
        })
    }

    fn active_slot(&self) -> Option<&Slot> {
        self.active.and_then(|k| self.slots[k.slot()].as_ref())
    }

    fn active_slot_mut(&mut self) -> Option<&mut Slot> {
        let kind = self.active?;
        self.slots[kind.slot()].as_mut()
    }

    fn is_active_instance(&self, instance: u64) -> bool {
        self.active_slot().is_some_and(|s| s.instance == instance)
    }
}

impl Drop for MultiPlayer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{BackendCall, FakeBackends, MockContentTypeProbe};
    use tokio::sync::mpsc;

    fn player(
        probe: MockContentTypeProbe,
    ) -> (MultiPlayer, FakeBackends, mpsc::UnboundedReceiver<MultiSignal>) {
        let backends = FakeBackends::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let notify: Arc<dyn Fn(MultiSignal) + Send + Sync> = Arc::new(move |s| {
            let _ = tx.send(s);
        });
        let player = MultiPlayer::new(backends.factory(), Arc::new(probe), notify, false);
        (player, backends, rx)
    }

    fn deliver(player: &mut MultiPlayer, signal: MultiSignal) -> Option<PlayerEvent> {
        match signal {
            MultiSignal::Backend { instance, event } => player.handle_backend_event(instance, event),
            MultiSignal::ContentType {
                request,
                content_type,
            } => {
                player.on_content_type(request, &content_type);
                None
            }
        }
    }

    #[tokio::test]
    async fn test_native_created_eagerly() {
        let (_player, backends, _rx) = player(MockContentTypeProbe::none());
        assert_eq!(backends.created(), vec![BackendKind::Native]);
    }

    #[tokio::test]
    async fn test_local_source_uses_buffered() {
        let (mut player, backends, _rx) = player(MockContentTypeProbe::none());
        player.set_data_source(DataSource::Local("/music/a.mp3".into()), None);

        assert_eq!(player.active_kind(), Some(BackendKind::Buffered));
        assert!(!player.is_initialized());
        let calls = backends.calls_for(BackendKind::Buffered);
        assert_eq!(
            calls,
            vec![
                BackendCall::SetDataSource(DataSource::Local("/music/a.mp3".into())),
                BackendCall::Prepare,
            ]
        );
    }

    #[tokio::test]
    async fn test_asf_probe_rewrites_to_demuxer() {
        let (mut player, backends, mut rx) =
            player(MockContentTypeProbe::returning("video/x-ms-asf"));
        player.set_data_source(DataSource::Remote("http://media.example/live".into()), None);
        assert_eq!(player.active_kind(), None);
        assert!(!player.is_initialized());

        let signal = rx.recv().await.unwrap();
        deliver(&mut player, signal);

        assert_eq!(player.active_kind(), Some(BackendKind::Demuxer));
        assert_eq!(
            backends.calls_for(BackendKind::Demuxer)[0],
            BackendCall::SetDataSource(DataSource::Remote("mmsh://media.example/live".into()))
        );
    }

    #[tokio::test]
    async fn test_failed_probe_continues_with_native() {
        let (mut player, _backends, mut rx) = player(MockContentTypeProbe::failing());
        player.set_data_source(DataSource::Remote("http://radio.example/live".into()), None);
        let signal = rx.recv().await.unwrap();
        assert_eq!(
            signal,
            MultiSignal::ContentType {
                request: 1,
                content_type: String::new()
            }
        );
        deliver(&mut player, signal);
        assert_eq!(player.active_kind(), Some(BackendKind::Native));
    }

    #[tokio::test]
    async fn test_known_content_type_skips_probe() {
        let (mut player, _backends, _rx) = player(MockContentTypeProbe::none());
        player.set_data_source(
            DataSource::Remote("http://radio.example/live".into()),
            Some("audio/aacp".into()),
        );
        assert_eq!(player.active_kind(), Some(BackendKind::Demuxer));
    }

    #[tokio::test]
    async fn test_prepared_initializes_and_controls_delegate() {
        let (mut player, backends, _rx) = player(MockContentTypeProbe::none());
        player.start();
        assert!(backends.calls_for(BackendKind::Native).is_empty());

        player.set_data_source(DataSource::Remote("rtsp://cam.example/a".into()), None);
        let instance = backends.instance_of(BackendKind::Native).unwrap();

        // Completion before preparation is ignored
        assert_eq!(player.handle_backend_event(instance, BackendEvent::Completed), None);
        assert_eq!(
            player.handle_backend_event(instance, BackendEvent::Prepared),
            Some(PlayerEvent::Prepared)
        );
        assert!(player.is_initialized());

        player.start();
        player.seek(Duration::from_secs(5));
        let calls = backends.calls_for(BackendKind::Native);
        assert!(calls.contains(&BackendCall::Start));
        assert!(calls.contains(&BackendCall::Seek(Duration::from_secs(5))));
        assert_eq!(player.position(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_set_source_failure_posts_generic_error() {
        let (mut player, backends, mut rx) = player(MockContentTypeProbe::none());
        backends.fail_set_data_source(true);
        player.set_data_source(DataSource::Local("/missing.mp3".into()), None);

        let signal = rx.recv().await.unwrap();
        assert_eq!(
            deliver(&mut player, signal),
            Some(PlayerEvent::Error(PlayerErrorKind::Generic))
        );
        assert!(!player.is_initialized());
    }

    #[tokio::test]
    async fn test_server_died_rebuilds_native() {
        let (mut player, backends, _rx) = player(MockContentTypeProbe::none());
        player.set_data_source(DataSource::Remote("rtsp://cam.example/a".into()), None);
        let old = backends.instance_of(BackendKind::Native).unwrap();
        player.handle_backend_event(old, BackendEvent::Prepared);

        let event = player.handle_backend_event(
            old,
            BackendEvent::Error {
                what: MEDIA_ERROR_SERVER_DIED,
                extra: 0,
            },
        );
        assert_eq!(event, Some(PlayerEvent::Error(PlayerErrorKind::ServerDied)));
        assert!(backends.calls_for_instance(old).contains(&BackendCall::Release));
        assert_eq!(backends.created(), vec![BackendKind::Native, BackendKind::Native]);
        assert_ne!(backends.instance_of(BackendKind::Native), Some(old));

        // Late events from the dead instance are dropped
        assert_eq!(player.handle_backend_event(old, BackendEvent::Completed), None);
    }

    #[tokio::test]
    async fn test_metadata_info_is_forwarded() {
        let (mut player, backends, _rx) = player(MockContentTypeProbe::none());
        player.set_data_source(DataSource::Remote("rtsp://cam.example/a".into()), None);
        let instance = backends.instance_of(BackendKind::Native).unwrap();
        assert_eq!(
            player.handle_backend_event(
                instance,
                BackendEvent::Info {
                    what: MEDIA_INFO_METADATA_UPDATE,
                    extra: 0
                }
            ),
            Some(PlayerEvent::MetadataUpdate)
        );
        assert_eq!(
            player.handle_backend_event(instance, BackendEvent::Info { what: 3, extra: 0 }),
            None
        );
    }
}
