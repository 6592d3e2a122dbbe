//! Batch metadata probe for freshly enqueued tracks.
//!
//! Tracks are probed one at a time with a pause between probes so slow
//! remote hosts are not hammered. Every failure is per-item: the track is
//! skipped and the batch continues.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{MetadataError, TrackMetadata, read_bytes, read_file, uri_extension};
use crate::db::{TrackStore, WriteLocks};
use crate::model::{Track, TrackId};
use crate::net::HttpClient;
use crate::player::backend::DataSource;
use crate::task::CancelToken;

/// Pulls tags for a single track.
#[async_trait]
pub trait TrackProbe: Send + Sync {
    async fn probe(&self, track: &Track) -> Result<TrackMetadata, MetadataError>;
}

/// Probe that reads local files directly and the leading bytes of HTTP
/// resources.
#[derive(Debug, Clone)]
pub struct TagProbe {
    client: HttpClient,
    max_probe_bytes: usize,
}

impl TagProbe {
    pub fn new(client: HttpClient, max_probe_bytes: usize) -> Self {
        Self {
            client,
            max_probe_bytes,
        }
    }
}

#[async_trait]
impl TrackProbe for TagProbe {
    async fn probe(&self, track: &Track) -> Result<TrackMetadata, MetadataError> {
        let task = match DataSource::from_uri(&track.uri) {
            DataSource::Local(path) => tokio::task::spawn_blocking(move || read_file(&path)),
            DataSource::Remote(uri) => {
                if !matches!(track.scheme().as_deref(), Some("http" | "https")) {
                    return Err(MetadataError::Unsupported(format!(
                        "cannot probe {}",
                        track.scheme().unwrap_or_default()
                    )));
                }
                let bytes = self
                    .client
                    .fetch_prefix(&uri, self.max_probe_bytes)
                    .await
                    .map_err(|e| MetadataError::Network(e.to_string()))?;
                let extension = uri_extension(&uri);
                tokio::task::spawn_blocking(move || read_bytes(bytes, extension.as_deref()))
            }
        };
        task.await.map_err(|e| MetadataError::Task(e.to_string()))?
    }
}

/// Timing and policy for one batch run.
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub initial_delay: Duration,
    pub spacing: Duration,
    pub include_artwork: bool,
}

/// A track whose row was updated by the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retrieved {
    pub id: TrackId,
    pub artwork: bool,
}

/// Probe `ids` in order, write back what was found and report each update.
///
/// Rows are only written when at least one of title, album or artist was
/// recovered. Cancellation is checked before every probe and every write.
pub async fn run_batch(
    ids: Vec<TrackId>,
    store: Arc<dyn TrackStore>,
    probe: Arc<dyn TrackProbe>,
    locks: WriteLocks,
    settings: BatchSettings,
    token: CancelToken,
    notify: impl Fn(Retrieved) + Send + Sync,
) {
    debug!(target: "metadata::batch", count = ids.len(), "Batch probe scheduled");
    tokio::time::sleep(settings.initial_delay).await;

    let mut updated = 0usize;
    for (i, id) in ids.into_iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(settings.spacing).await;
        }
        if token.is_cancelled() {
            debug!(target: "metadata::batch", "Batch probe cancelled");
            return;
        }

        let track = match store.get_track(id).await {
            Ok(Some(track)) => track,
            Ok(None) => continue,
            Err(e) => {
                warn!(target: "metadata::batch", id = %id, error = %e, "Failed to load track");
                continue;
            }
        };

        let metadata = match probe.probe(&track).await {
            Ok(metadata) if metadata.has_tags() => metadata,
            Ok(_) => {
                debug!(target: "metadata::batch", id = %id, uri = %track.uri, "No tags found");
                continue;
            }
            Err(e) => {
                debug!(target: "metadata::batch", id = %id, uri = %track.uri, error = %e, "Probe failed");
                continue;
            }
        };

        let update = metadata.into_update(settings.include_artwork);
        let artwork = update.artwork.is_some();
        if token.is_cancelled() {
            return;
        }

        match locks.update(store.as_ref(), id, &update).await {
            Ok(true) => {
                updated += 1;
                notify(Retrieved { id, artwork });
            }
            Ok(false) => {}
            Err(e) => {
                warn!(target: "metadata::batch", id = %id, error = %e, "Failed to store metadata");
            }
        }
    }

    info!(target: "metadata::batch", updated, "Batch probe finished");
}
