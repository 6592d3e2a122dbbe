//! Live radio metadata poller.
//!
//! While an ICY-capable stream plays, the poller reconnects every interval,
//! reads the first metadata block and stores the parsed artist/title. Two
//! consecutive probes without a title stop it until the service restarts it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::MetadataError;
use super::icy::{IcyBlockReader, MAX_BLOCK_LEN, parse_block, split_title};
use crate::db::{TrackStore, WriteLocks};
use crate::model::{TrackId, TrackUpdate};
use crate::net::HttpClient;
use crate::task::CancelToken;

/// Consecutive empty probes after which the poller gives up.
pub const MAX_MISSES: u32 = 2;

/// One round trip to a stream's metadata side channel.
#[async_trait]
pub trait StreamMetadataSource: Send + Sync {
    /// `Ok(None)` when the stream carried no usable title.
    async fn fetch_title(&self, uri: &str) -> Result<Option<String>, MetadataError>;
}

/// ICY probe over HTTP.
///
/// Servers answering with a bare `ICY 200 OK` status line instead of an
/// HTTP one are not understood by the HTTP client and count as empty.
#[derive(Debug, Clone)]
pub struct IcyHttpSource {
    client: HttpClient,
}

impl IcyHttpSource {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StreamMetadataSource for IcyHttpSource {
    async fn fetch_title(&self, uri: &str) -> Result<Option<String>, MetadataError> {
        let mut response = self
            .client
            .inner()
            .get(uri)
            .header("Icy-MetaData", "1")
            .header(reqwest::header::CONNECTION, "close")
            .send()
            .await
            .map_err(|e| MetadataError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MetadataError::Network(format!("HTTP {}", response.status())));
        }

        let metaint = response
            .headers()
            .get("icy-metaint")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if metaint == 0 {
            debug!(target: "metadata::poller", uri, "Stream has no icy-metaint");
            return Ok(None);
        }

        let limit = metaint + 1 + MAX_BLOCK_LEN;
        let mut reader = IcyBlockReader::new(metaint);
        let mut read = 0usize;
        while read < limit {
            let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| MetadataError::Network(e.to_string()))?
            else {
                break;
            };
            read += chunk.len();
            if let Some(block) = reader.feed(&chunk) {
                return Ok(parse_block(&block));
            }
        }
        Ok(None)
    }
}

/// Things the poller reports back to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerEvent {
    /// The track row was updated with a fresh title
    Updated(TrackId),
    /// Gave up after consecutive empty probes
    Stopped(TrackId),
}

/// Poll `uri` until cancelled or until [`MAX_MISSES`] empty probes in a row.
///
/// A new cycle only starts after the previous sleep finished, so polls never
/// overlap. Cancellation suppresses every later write and notification,
/// including `Stopped`.
pub async fn run_poller(
    id: TrackId,
    uri: String,
    source: Arc<dyn StreamMetadataSource>,
    store: Arc<dyn TrackStore>,
    locks: WriteLocks,
    interval: Duration,
    token: CancelToken,
    notify: impl Fn(PollerEvent) + Send + Sync,
) {
    info!(target: "metadata::poller", id = %id, uri = %uri, "Polling stream metadata");
    let mut misses = 0u32;

    loop {
        if token.is_cancelled() {
            return;
        }

        let title = match source.fetch_title(&uri).await {
            Ok(title) => title,
            Err(e) => {
                debug!(target: "metadata::poller", uri = %uri, error = %e, "Metadata probe failed");
                None
            }
        };
        if token.is_cancelled() {
            return;
        }

        match title {
            Some(value) => {
                misses = 0;
                let parsed = split_title(&value);
                let update = TrackUpdate {
                    artist: Some(parsed.artist).filter(|s| !s.is_empty()),
                    title: Some(parsed.title).filter(|s| !s.is_empty()),
                    ..Default::default()
                };
                match locks.update(store.as_ref(), id, &update).await {
                    Ok(true) => notify(PollerEvent::Updated(id)),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(target: "metadata::poller", id = %id, error = %e, "Failed to store stream title");
                    }
                }
            }
            None => {
                misses += 1;
                if misses >= MAX_MISSES {
                    info!(target: "metadata::poller", id = %id, "No stream metadata, stopping");
                    notify(PollerEvent::Stopped(id));
                    return;
                }
            }
        }

        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryTrackStore, MockStreamSource};
    use parking_lot::Mutex;

    const INTERVAL: Duration = Duration::from_secs(10);

    async fn poll(
        store: &MemoryTrackStore,
        id: TrackId,
        source: MockStreamSource,
        token: CancelToken,
    ) -> Vec<PollerEvent> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        run_poller(
            id,
            "http://radio.example/live".to_string(),
            Arc::new(source),
            Arc::new(store.clone()),
            WriteLocks::new(),
            INTERVAL,
            token,
            move |e| sink.lock().push(e),
        )
        .await;
        let seen = seen.lock().clone();
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_empty_probes_stop_the_poller() {
        let store = MemoryTrackStore::new();
        let id = store.insert("http://radio.example/live");
        let source = MockStreamSource::scripted([None, None, Some("A - B")]);

        let events = poll(&store, id, source.clone(), CancelToken::new()).await;

        assert_eq!(events, vec![PollerEvent::Stopped(id)]);
        assert_eq!(source.calls(), 2);
        assert_eq!(store.track(id).unwrap().title, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_title_resets_miss_count() {
        let store = MemoryTrackStore::new();
        let id = store.insert("http://radio.example/live");
        let source = MockStreamSource::scripted([
            Some("Daft Punk - Around the World"),
            None,
            Some("Air - La Femme"),
            None,
            None,
        ]);

        let events = poll(&store, id, source.clone(), CancelToken::new()).await;

        assert_eq!(
            events,
            vec![
                PollerEvent::Updated(id),
                PollerEvent::Updated(id),
                PollerEvent::Stopped(id)
            ]
        );
        assert_eq!(source.calls(), 5);
        let track = store.track(id).unwrap();
        assert_eq!(track.artist.as_deref(), Some("Air"));
        assert_eq!(track.title.as_deref(), Some("La Femme"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_count_as_empty() {
        let store = MemoryTrackStore::new();
        let id = store.insert("http://radio.example/live");
        let source = MockStreamSource::failing();

        let events = poll(&store, id, source.clone(), CancelToken::new()).await;

        assert_eq!(events, vec![PollerEvent::Stopped(id)]);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_poller_is_silent() {
        let store = MemoryTrackStore::new();
        let id = store.insert("http://radio.example/live");
        let token = CancelToken::new();
        token.cancel();

        let events = poll(&store, id, MockStreamSource::scripted([Some("A - B")]), token).await;
        assert!(events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_are_spaced_by_interval() {
        let store = MemoryTrackStore::new();
        let id = store.insert("http://radio.example/live");
        let source = MockStreamSource::scripted([Some("A - B"), None, None]);

        let start = tokio::time::Instant::now();
        poll(&store, id, source, CancelToken::new()).await;

        // Three probes, two sleeps between them
        let elapsed = start.elapsed();
        assert!(elapsed >= INTERVAL * 2 && elapsed < INTERVAL * 3);
    }
}
