//! Backends that drive an external player program.
//!
//! Preparation runs the probe program (`ffprobe`-compatible) to learn the
//! duration; playback spawns the player program (`ffplay`-compatible) from
//! the current offset. Pausing kills the player and remembers the offset.
//!
//! The three backend kinds share this implementation and differ only in the
//! sources they accept.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    BackendError, BackendEvent, BackendFactory, BackendKind, DEMUXER_SCHEMES, DataSource,
    EventSink, MEDIA_ERROR_SERVER_DIED, MEDIA_ERROR_UNKNOWN, PlayerBackend,
};
use crate::config::BackendConfig;

/// Builds [`ProcessBackend`]s from the configured programs.
#[derive(Debug, Clone, Default)]
pub struct ProcessBackendFactory {
    config: BackendConfig,
}

impl ProcessBackendFactory {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

impl BackendFactory for ProcessBackendFactory {
    fn create(&mut self, kind: BackendKind, events: EventSink) -> Box<dyn PlayerBackend> {
        Box::new(ProcessBackend::new(kind, self.config.clone(), events))
    }
}

#[derive(Debug, Default)]
struct Shared {
    /// Bumped whenever the data source changes
    generation: u64,
    /// Bumped whenever the running player is stopped
    play_run: u64,
    prepared: bool,
    playing: bool,
    duration: Option<Duration>,
}

pub struct ProcessBackend {
    kind: BackendKind,
    config: BackendConfig,
    events: EventSink,
    source: Option<DataSource>,
    shared: Arc<Mutex<Shared>>,
    offset: Duration,
    started_at: Option<Instant>,
    volume: f32,
    stop_player: Option<oneshot::Sender<()>>,
    released: bool,
}

impl ProcessBackend {
    pub fn new(kind: BackendKind, config: BackendConfig, events: EventSink) -> Self {
        Self {
            kind,
            config,
            events,
            source: None,
            shared: Arc::new(Mutex::new(Shared::default())),
            offset: Duration::ZERO,
            started_at: None,
            volume: 1.0,
            stop_player: None,
            released: false,
        }
    }

    fn accepts(&self, source: &DataSource) -> bool {
        match (self.kind, source) {
            (BackendKind::Buffered, DataSource::Local(_)) => true,
            (BackendKind::Buffered, DataSource::Remote(_)) => false,
            (BackendKind::Native, DataSource::Remote(_)) => !source
                .scheme()
                .is_some_and(|s| DEMUXER_SCHEMES.contains(&s.as_str())),
            (BackendKind::Native, DataSource::Local(_)) => false,
            (BackendKind::Demuxer, _) => true,
        }
    }

    fn ensure_usable(&self) -> Result<(), BackendError> {
        if self.released {
            return Err(BackendError::IllegalState("backend released"));
        }
        Ok(())
    }

    fn ensure_prepared(&self) -> Result<(), BackendError> {
        self.ensure_usable()?;
        if !self.shared.lock().prepared {
            return Err(BackendError::IllegalState("not prepared"));
        }
        Ok(())
    }

    fn current_position(&self) -> Duration {
        let position = match self.started_at {
            Some(started) => self.offset + started.elapsed(),
            None => self.offset,
        };
        match self.shared.lock().duration {
            Some(total) => position.min(total),
            None => position,
        }
    }

    fn spawn_player(&mut self) -> Result<(), BackendError> {
        let Some(source) = &self.source else {
            return Err(BackendError::IllegalState("no data source"));
        };

        let mut child = Command::new(&self.config.player_program)
            .args(["-nodisp", "-autoexit", "-loglevel", "error"])
            .arg("-volume")
            .arg(((self.volume.clamp(0.0, 1.0) * 100.0).round() as u32).to_string())
            .arg("-ss")
            .arg(format!("{:.3}", self.offset.as_secs_f64()))
            .arg(source.as_arg())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackendError::Process(format!("Failed to run {}: {}", self.config.player_program, e))
            })?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (generation, run) = {
            let mut shared = self.shared.lock();
            shared.playing = true;
            (shared.generation, shared.play_run)
        };
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        let kind = self.kind;

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    {
                        let mut s = shared.lock();
                        if s.generation != generation || s.play_run != run {
                            return;
                        }
                        s.playing = false;
                    }
                    match status {
                        Ok(status) if status.success() => events.emit(BackendEvent::Completed),
                        // Killed by a signal from outside
                        Ok(status) if status.code().is_none() => {
                            warn!(target: "player::backend", ?kind, "Player process terminated");
                            events.emit(BackendEvent::Error { what: MEDIA_ERROR_SERVER_DIED, extra: 0 });
                        }
                        Ok(status) => {
                            events.emit(BackendEvent::Error {
                                what: MEDIA_ERROR_UNKNOWN,
                                extra: status.code().unwrap_or_default(),
                            });
                        }
                        Err(e) => {
                            warn!(target: "player::backend", ?kind, error = %e, "Lost player process");
                            events.emit(BackendEvent::Error { what: MEDIA_ERROR_SERVER_DIED, extra: 0 });
                        }
                    }
                }
                _ = stop_rx => {
                    let _ = child.kill().await;
                }
            }
        });

        self.stop_player = Some(stop_tx);
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn stop_player(&mut self) {
        if let Some(started) = self.started_at.take() {
            self.offset += started.elapsed();
        }
        {
            let mut shared = self.shared.lock();
            shared.play_run += 1;
            shared.playing = false;
        }
        // Dropping the sender also stops the watcher
        if let Some(stop) = self.stop_player.take() {
            let _ = stop.send(());
        }
    }
}

impl PlayerBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn set_data_source(&mut self, source: &DataSource) -> Result<(), BackendError> {
        self.ensure_usable()?;
        if !self.accepts(source) {
            return Err(BackendError::InvalidSource(source.as_arg()));
        }
        self.reset();
        self.source = Some(source.clone());
        Ok(())
    }

    fn prepare_async(&mut self) -> Result<(), BackendError> {
        self.ensure_usable()?;
        let Some(source) = &self.source else {
            return Err(BackendError::IllegalState("prepare without data source"));
        };

        let program = self.config.probe_program.clone();
        let target = source.as_arg();
        let generation = self.shared.lock().generation;
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = probe_duration(&program, &target).await;
            {
                let mut s = shared.lock();
                if s.generation != generation {
                    return;
                }
                if let Ok(duration) = &result {
                    s.duration = *duration;
                    s.prepared = true;
                }
            }
            match result {
                Ok(duration) => {
                    debug!(target: "player::backend", source = %target, ?duration, "Prepared");
                    events.emit(BackendEvent::Prepared);
                }
                Err(e) => {
                    warn!(target: "player::backend", source = %target, error = %e, "Prepare failed");
                    events.emit(BackendEvent::Error {
                        what: MEDIA_ERROR_UNKNOWN,
                        extra: 0,
                    });
                }
            }
        });
        Ok(())
    }

    fn start(&mut self) -> Result<(), BackendError> {
        self.ensure_prepared()?;
        if self.started_at.is_some() {
            return Ok(());
        }
        self.spawn_player()
    }

    fn pause(&mut self) -> Result<(), BackendError> {
        self.ensure_prepared()?;
        self.stop_player();
        Ok(())
    }

    fn reset(&mut self) {
        self.stop_player();
        let mut shared = self.shared.lock();
        shared.generation += 1;
        shared.prepared = false;
        shared.duration = None;
        drop(shared);
        self.source = None;
        self.offset = Duration::ZERO;
    }

    fn seek(&mut self, position: Duration) -> Result<(), BackendError> {
        self.ensure_prepared()?;
        let was_playing = self.started_at.is_some();
        self.stop_player();
        self.offset = match self.shared.lock().duration {
            Some(total) => position.min(total),
            None => position,
        };
        if was_playing {
            self.spawn_player()?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.reset();
        self.released = true;
    }

    fn duration(&self) -> Option<Duration> {
        self.shared.lock().duration
    }

    fn position(&self) -> Duration {
        self.current_position()
    }

    fn set_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        if (volume - self.volume).abs() < f32::EPSILON {
            return;
        }
        self.volume = volume;
        // The player program reads volume at startup only
        if self.started_at.is_some() {
            self.stop_player();
            if let Err(e) = self.spawn_player() {
                warn!(target: "player::backend", kind = ?self.kind, error = %e, "Failed to restart player");
                self.events.emit(BackendEvent::Error {
                    what: MEDIA_ERROR_UNKNOWN,
                    extra: 0,
                });
            }
        }
    }

    fn live_volume(&self) -> bool {
        false
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        self.stop_player();
    }
}

/// Run the probe program and read the container duration.
async fn probe_duration(program: &str, target: &str) -> Result<Option<Duration>, BackendError> {
    let output = Command::new(program)
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
        .arg(target)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| BackendError::Process(format!("Failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::Process(format!(
            "{} failed: {}",
            program,
            stderr.trim()
        )));
    }

    parse_probe_json(&String::from_utf8_lossy(&output.stdout))
}

/// Probe JSON output; live streams report no duration or `"N/A"`.
fn parse_probe_json(json: &str) -> Result<Option<Duration>, BackendError> {
    let parsed: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| BackendError::Process(format!("Failed to parse probe output: {}", e)))?;

    Ok(parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64))
}

#[derive(Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}
