//! Track metadata reading.
//!
//! Uses symphonia's probe to pull tags, embedded artwork and duration from
//! local files or from the leading bytes of a remote stream.
//!
//! # Workers
//! - [`batch`]: probes a freshly enqueued list of tracks one by one
//! - [`poller`]: polls the in-band ICY title of a playing radio stream

pub mod batch;
pub mod icy;
pub mod poller;

use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey, StandardVisualKey};
use symphonia::core::probe::Hint;

use crate::model::TrackUpdate;

/// Tags recovered from a probe. Empty values are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration: Option<Duration>,
    pub artwork: Option<Vec<u8>>,
}

impl TrackMetadata {
    /// At least one of title, album or artist was found.
    pub fn has_tags(&self) -> bool {
        self.title.is_some() || self.album.is_some() || self.artist.is_some()
    }

    /// Store update for this probe. Artwork is dropped unless requested.
    pub fn into_update(self, include_artwork: bool) -> TrackUpdate {
        TrackUpdate {
            title: self.title,
            album: self.album,
            artist: self.artist,
            duration_ms: self
                .duration
                .map(|d| d.as_millis() as i64)
                .filter(|ms| *ms > 0),
            artwork: if include_artwork { self.artwork } else { None },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported format: {0}")]
    Unsupported(String),

    #[error("Probe task failed: {0}")]
    Task(String),
}

/// Read tags from a file on disk.
pub fn read_file(path: &Path) -> Result<TrackMetadata, MetadataError> {
    let file = File::open(path)?;
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    read_source(Box::new(file), extension.as_deref())
}

/// Read tags from the leading bytes of a stream.
///
/// `extension` is a format hint taken from the URI, if any.
pub fn read_bytes(bytes: Vec<u8>, extension: Option<&str>) -> Result<TrackMetadata, MetadataError> {
    read_source(Box::new(Cursor::new(bytes)), extension)
}

/// File extension of the last URI path segment, ignoring query and fragment.
pub fn uri_extension(uri: &str) -> Option<String> {
    let path = uri.split(['?', '#']).next().unwrap_or_default();
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    (!stem.is_empty() && !ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

fn read_source(source: Box<dyn MediaSource>, extension: Option<&str>) -> Result<TrackMetadata, MetadataError> {
    let mss = MediaSourceStream::new(source, Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let mut probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| MetadataError::Unsupported(e.to_string()))?;

    let mut metadata = TrackMetadata::default();

    // Tags found ahead of the container (ID3v2)
    if let Some(probe_meta) = probed.metadata.get()
        && let Some(revision) = probe_meta.current()
    {
        apply_revision(&mut metadata, revision);
    }

    while !probed.format.metadata().is_latest() {
        probed.format.metadata().pop();
    }
    if let Some(revision) = probed.format.metadata().current() {
        apply_revision(&mut metadata, revision);
    }

    metadata.duration = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .and_then(|t| duration_of(&t.codec_params));

    Ok(metadata)
}

fn apply_revision(metadata: &mut TrackMetadata, revision: &MetadataRevision) {
    for tag in revision.tags() {
        let slot = match tag.std_key {
            Some(StandardTagKey::TrackTitle) => &mut metadata.title,
            Some(StandardTagKey::Artist) => &mut metadata.artist,
            Some(StandardTagKey::Album) => &mut metadata.album,
            _ => continue,
        };
        let value = tag.value.to_string();
        let value = value.trim();
        if slot.is_none() && !value.is_empty() {
            *slot = Some(value.to_string());
        }
    }

    if metadata.artwork.is_none() {
        metadata.artwork = first_visual(revision);
    }
}

/// Front cover if tagged as such, otherwise the first non-empty picture.
fn first_visual(revision: &MetadataRevision) -> Option<Vec<u8>> {
    let visuals = revision.visuals();
    visuals
        .iter()
        .find(|v| matches!(v.usage, Some(StandardVisualKey::FrontCover)) && !v.data.is_empty())
        .or_else(|| visuals.iter().find(|v| !v.data.is_empty()))
        .map(|v| v.data.to_vec())
}

fn duration_of(params: &CodecParameters) -> Option<Duration> {
    let n_frames = params.n_frames?;
    let duration = match (params.time_base, params.sample_rate) {
        (Some(tb), _) => {
            let time = tb.calc_time(n_frames);
            Duration::from_secs_f64(time.seconds as f64 + time.frac)
        }
        (None, Some(rate)) if rate > 0 => Duration::from_secs_f64(n_frames as f64 / rate as f64),
        _ => return None,
    };
    (!duration.is_zero()).then_some(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::wav_bytes;

    #[test]
    fn test_read_wav_duration() {
        let metadata = read_bytes(wav_bytes(8000, 8000), Some("wav")).unwrap();
        assert_eq!(metadata.duration, Some(Duration::from_secs(1)));
        assert!(!metadata.has_tags());
    }

    #[test]
    fn test_read_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        std::fs::write(&path, wav_bytes(8000, 4000)).unwrap();

        let metadata = read_file(&path).unwrap();
        assert_eq!(metadata.duration, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_garbage_is_unsupported() {
        let result = read_bytes(b"definitely not audio".to_vec(), None);
        assert!(matches!(result, Err(MetadataError::Unsupported(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = read_file(Path::new("/nonexistent/file.mp3"));
        assert!(matches!(result, Err(MetadataError::Io(_))));
    }

    #[test]
    fn test_uri_extension() {
        assert_eq!(uri_extension("http://h.example/a/song.MP3?x=1"), Some("mp3".into()));
        assert_eq!(uri_extension("/music/track.flac"), Some("flac".into()));
        assert_eq!(uri_extension("http://radio.example/live"), None);
        assert_eq!(uri_extension("http://radio.example/.hidden"), None);
    }

    #[test]
    fn test_into_update_drops_artwork_unless_requested() {
        let metadata = TrackMetadata {
            title: Some("Song".into()),
            duration: Some(Duration::from_millis(1500)),
            artwork: Some(vec![1, 2, 3]),
            ..Default::default()
        };
        assert!(metadata.has_tags());

        let update = metadata.clone().into_update(false);
        assert_eq!(update.title.as_deref(), Some("Song"));
        assert_eq!(update.duration_ms, Some(1500));
        assert_eq!(update.artwork, None);

        assert_eq!(metadata.into_update(true).artwork, Some(vec![1, 2, 3]));
    }
}
