//! Player backends and backend selection.
//!
//! A backend plays exactly one stream at a time and reports its lifecycle
//! asynchronously through an [`EventSink`]. Which backend handles a source is
//! decided by [`select_backend`], a pure function of the URI scheme, the
//! content type and the local-file flag.
//!
//! ```text
//!   DataSource ──► select_backend ──► Native | Buffered | Demuxer
//!                                          │
//!                      EventSink ◄─────────┘  Prepared / Completed / Error / Info
//! ```

pub mod multi;
pub mod process;

pub use multi::{MultiPlayer, MultiSignal, PlayerErrorKind, PlayerEvent};
pub use process::ProcessBackendFactory;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::model::uri_scheme;

/// Unspecified backend failure.
pub const MEDIA_ERROR_UNKNOWN: i32 = 1;
/// The backend process went away and must be rebuilt.
pub const MEDIA_ERROR_SERVER_DIED: i32 = 100;
/// In-band metadata changed.
pub const MEDIA_INFO_METADATA_UPDATE: i32 = 802;

/// Schemes that only the demuxer backend can open.
const DEMUXER_SCHEMES: &[&str] = &["mms", "mmsh", "mmst"];

/// Content types announcing a Windows Media stream reachable over `mmsh`.
const ASF_CONTENT_TYPES: &[&str] = &["video/x-ms-asf", "application/vnd.ms-asf"];

/// Audio types the native backend cannot decode.
const NATIVE_UNSUPPORTED_TYPES: &[&str] = &["audio/aacp", "audio/x-ms-wma", "audio/x-ms-wax"];

/// The closed set of backend implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Single-stream player for common network schemes
    Native,
    /// Plays files that are already on disk
    Buffered,
    /// Generic demuxer, handles MMS and exotic codecs
    Demuxer,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [Self::Native, Self::Buffered, Self::Demuxer];

    fn slot(self) -> usize {
        match self {
            Self::Native => 0,
            Self::Buffered => 1,
            Self::Demuxer => 2,
        }
    }
}

/// What a backend is asked to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Remote(String),
    Local(PathBuf),
}

impl DataSource {
    /// Classify a track URI: `file://` URIs and bare paths are local.
    pub fn from_uri(uri: &str) -> Self {
        match uri_scheme(uri).as_deref() {
            None => Self::Local(PathBuf::from(uri)),
            Some("file") => {
                let path = uri.split_once("://").map(|(_, p)| p).unwrap_or(uri);
                Self::Local(PathBuf::from(
                    urlencoding::decode(path)
                        .map(|p| p.into_owned())
                        .unwrap_or_else(|_| path.to_string()),
                ))
            }
            Some(_) => Self::Remote(uri.to_string()),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn scheme(&self) -> Option<String> {
        match self {
            Self::Remote(uri) => uri_scheme(uri),
            Self::Local(_) => Some("file".to_string()),
        }
    }

    /// Argument form handed to external programs.
    pub fn as_arg(&self) -> String {
        match self {
            Self::Remote(uri) => uri.clone(),
            Self::Local(path) => path.display().to_string(),
        }
    }
}

/// Pick the backend for a source.
///
/// Local files always use the buffered backend. Remote sources go to the
/// demuxer when the scheme requires it, the content type is one the native
/// backend cannot decode, or the user asked for the alternate backend.
pub fn select_backend(
    scheme: Option<&str>,
    content_type: Option<&str>,
    is_local: bool,
    prefer_demuxer: bool,
) -> BackendKind {
    if is_local {
        return BackendKind::Buffered;
    }
    let content_type = content_type.map(normalize_content_type);
    if content_type
        .as_deref()
        .is_some_and(|ct| NATIVE_UNSUPPORTED_TYPES.contains(&ct))
    {
        return BackendKind::Demuxer;
    }
    if prefer_demuxer {
        return BackendKind::Demuxer;
    }
    match scheme {
        Some(s) if DEMUXER_SCHEMES.contains(&s.to_ascii_lowercase().as_str()) => {
            BackendKind::Demuxer
        }
        _ => BackendKind::Native,
    }
}

/// Rewrite `http://` to `mmsh://` when the server announced a Windows Media
/// stream. Other URIs are returned unchanged.
pub fn rewrite_for_content_type(uri: &str, content_type: &str) -> String {
    let content_type = normalize_content_type(content_type);
    if !ASF_CONTENT_TYPES.contains(&content_type.as_str()) {
        return uri.to_string();
    }
    match uri.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => format!("mmsh://{}", rest),
        _ => uri.to_string(),
    }
}

/// `Audio/AACP; charset=x` → `audio/aacp`
fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Lifecycle events reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    Prepared,
    Completed,
    Error { what: i32, extra: i32 },
    Info { what: i32, extra: i32 },
}

/// Where a backend instance reports its events.
///
/// Each instance gets its own id so events from a released instance can be
/// told apart from the live one.
#[derive(Clone)]
pub struct EventSink {
    instance: u64,
    send: Arc<dyn Fn(u64, BackendEvent) + Send + Sync>,
}

impl EventSink {
    pub fn new(instance: u64, send: Arc<dyn Fn(u64, BackendEvent) + Send + Sync>) -> Self {
        Self { instance, send }
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn emit(&self, event: BackendEvent) {
        (self.send)(self.instance, event);
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

/// Backend errors. These never reach the playback state machine directly;
/// [`MultiPlayer`] turns them into posted error events.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Invalid data source: {0}")]
    InvalidSource(String),

    #[error("Illegal state: {0}")]
    IllegalState(&'static str),

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    #[error("Process error: {0}")]
    Process(String),
}

/// A single-stream player.
///
/// Control calls must not block; preparation completes asynchronously with
/// a [`BackendEvent::Prepared`] or [`BackendEvent::Error`].
pub trait PlayerBackend: Send {
    fn kind(&self) -> BackendKind;

    fn set_data_source(&mut self, source: &DataSource) -> Result<(), BackendError>;

    fn prepare_async(&mut self) -> Result<(), BackendError>;

    fn start(&mut self) -> Result<(), BackendError>;

    fn pause(&mut self) -> Result<(), BackendError>;

    /// Stop playback and forget the data source.
    fn reset(&mut self);

    fn seek(&mut self, position: Duration) -> Result<(), BackendError>;

    /// Free every resource. The instance is unusable afterwards.
    fn release(&mut self);

    /// `None` for live streams or before preparation.
    fn duration(&self) -> Option<Duration>;

    fn position(&self) -> Duration;

    fn set_volume(&mut self, volume: f32);

    /// Whether a volume change is heard while the stream plays. Backends
    /// returning false restart their output to apply it, so callers should
    /// set the final volume in one step rather than fade.
    fn live_volume(&self) -> bool {
        true
    }

    /// Hand over the source that follows the current one, for gapless
    /// playback. Backends without support reject it.
    fn set_next_data_source(&mut self, _source: Option<&DataSource>) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("next data source"))
    }
}

/// Constructs concrete backends.
pub trait BackendFactory: Send {
    fn create(&mut self, kind: BackendKind, events: EventSink) -> Box<dyn PlayerBackend>;
}
