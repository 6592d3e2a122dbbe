//! Foreground playback.

use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use super::open_db;
use crate::config::{self, Config};
use crate::db::SqliteTrackStore;
use crate::metadata::batch::TagProbe;
use crate::metadata::poller::IcyHttpSource;
use crate::model::TrackId;
use crate::net::{Downloader, HttpClient};
use crate::player::backend::ProcessBackendFactory;
use crate::player::connectivity::NoopWifiLock;
use crate::player::events::PlaybackEvent;
use crate::player::focus::NoopAudioSession;
use crate::player::service::{PlaybackService, ServiceDeps};
use crate::player::state::{PlaybackStatus, RepeatMode, ShuffleMode};

/// Run the playback service until the queue ends or Ctrl-C
pub fn cmd_play(
    rt: &Runtime,
    db_path: &Path,
    config: Config,
    ids: &[i64],
    shuffle: bool,
    repeat: RepeatMode,
    sleep: Option<u32>,
) -> anyhow::Result<()> {
    rt.block_on(async {
        let store = SqliteTrackStore::new(open_db(db_path).await?);
        let client = HttpClient::new(config.metadata.poll_timeout())?;
        let deps = ServiceDeps {
            store: Arc::new(store),
            backends: Box::new(ProcessBackendFactory::new(config.backend.clone())),
            content_types: Arc::new(client.clone()),
            track_probe: Arc::new(TagProbe::new(client.clone(), config.metadata.max_probe_bytes)),
            stream_source: Arc::new(IcyHttpSource::new(client.clone())),
            downloader: Some(Downloader::new(client, config::cache_dir())),
            audio_session: Box::new(NoopAudioSession),
            wifi_lock: Box::new(NoopWifiLock),
            config,
        };

        let (service, handle) = PlaybackService::new(deps);
        let mut events = handle.subscribe();
        let task = tokio::spawn(service.run());

        if ids.is_empty() {
            if handle.queue().await?.is_empty() {
                println!("Nothing to play. Pass track ids or add tracks first.");
                handle.shutdown().await?;
                task.await?;
                return Ok(());
            }
            info!(target: "cli", "Resuming saved queue");
            handle.play()?;
        } else {
            let mode = if shuffle { ShuffleMode::On } else { ShuffleMode::Off };
            handle.set_shuffle_mode(mode)?;
            let ids: Vec<TrackId> = ids.iter().copied().map(TrackId).collect();
            handle.open(ids, (!shuffle).then_some(0))?;
        }
        handle.set_repeat_mode(repeat)?;
        if let Some(minutes) = sleep {
            handle.set_sleep_timer(minutes)?;
        }

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    println!("Stopping...");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        print_event(&event);
                        match event {
                            PlaybackEvent::PlaybackComplete(_) => {
                                let status = handle.player_status().await?;
                                if status.status == PlaybackStatus::Stopped && !status.playing {
                                    println!("End of queue.");
                                    break;
                                }
                            }
                            PlaybackEvent::Error { .. } | PlaybackEvent::PlayerClosed => break,
                            _ => {}
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(target: "cli", skipped = n, "Event listener fell behind");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        handle.shutdown().await?;
        task.await?;
        Ok(())
    })
}

fn print_event(event: &PlaybackEvent) {
    match event {
        PlaybackEvent::StartDialog => println!("Opening..."),
        PlaybackEvent::PlaybackStarted(np) => println!("▶ {}", np.display()),
        PlaybackEvent::PlayStateChanged(np) if !np.playing => println!("⏸ {}", np.display()),
        PlaybackEvent::MetaChanged(np) if np.playing => println!("♪ {}", np.display()),
        PlaybackEvent::ConnectivityChanged { connected } => {
            println!("Network {}", if *connected { "restored" } else { "lost" })
        }
        PlaybackEvent::Error { .. } => eprintln!("Playback failed: no track in the queue could be opened."),
        _ => {}
    }
}
