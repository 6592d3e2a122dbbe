//! Database module for track rows and the persisted play queue.
//!
//! Uses SQLx with SQLite for lightweight, embedded storage. The playback
//! core only talks to the [`TrackStore`] trait; the free functions here are
//! its SQLite implementation and the CLI's way of adding rows.
//!
//! # Example
//!
//! ```ignore
//! use servestream::db::{init_db, SqliteTrackStore, TrackStore};
//!
//! let pool = init_db("sqlite:servestream.db").await?;
//! let store = SqliteTrackStore::new(pool);
//! let track = store.get_track(TrackId(1)).await?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{Track, TrackId, TrackUpdate};
use crate::player::queue::QueueSnapshot;

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "servestream.db";

const TRACK_COLUMNS: &str = "id, uri, title, album, artist, duration_ms, artwork";

/// Build a SQLite database URL from an optional path.
///
/// If no path is provided, uses [`DEFAULT_DB_NAME`] in the current directory.
///
/// # Arguments
///
/// * `path` - Optional path to the database file
///
/// # Returns
///
/// A SQLite connection URL string (e.g., "sqlite:servestream.db")
pub fn db_url(path: Option<&std::path::Path>) -> String {
    match path {
        Some(p) => format!("sqlite:{}", p.display()),
        None => format!("sqlite:{}", DEFAULT_DB_NAME),
    }
}

/// Initialize the database connection pool and run migrations.
///
/// Creates the database file if it doesn't exist, establishes a connection
/// pool with up to 5 connections, and runs all pending migrations.
///
/// # Arguments
///
/// * `db_url` - SQLite connection URL (e.g., "sqlite:servestream.db")
///
/// # Errors
///
/// Returns an error if:
/// - Database creation fails
/// - Connection cannot be established
/// - Migration fails
pub async fn init_db(db_url: &str) -> Result<SqlitePool> {
    if !sqlx::Sqlite::database_exists(db_url).await.unwrap_or(false) {
        sqlx::Sqlite::create_database(db_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Insert a track row for a URI or local path.
///
/// # Returns
///
/// The database ID of the new track.
pub async fn insert_track(pool: &SqlitePool, uri: &str) -> Result<TrackId> {
    let row: (i64,) = sqlx::query_as("INSERT INTO tracks (uri, updated_at) VALUES (?, ?) RETURNING id")
        .bind(uri)
        .bind(chrono::Utc::now().to_rfc3339())
        .fetch_one(pool)
        .await?;
    Ok(TrackId(row.0))
}

/// Get all tracks, ordered by id.
pub async fn get_all_tracks(pool: &SqlitePool) -> Result<Vec<Track>> {
    let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks ORDER BY id");
    Ok(sqlx::query_as::<_, Track>(&sql).fetch_all(pool).await?)
}

/// Get a track by its database ID.
///
/// # Returns
///
/// The track if found, or None.
pub async fn get_track_by_id(pool: &SqlitePool, id: TrackId) -> Result<Option<Track>> {
    let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = ?");
    Ok(sqlx::query_as::<_, Track>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

/// Get several tracks, returned in the order of `ids`.
///
/// Unknown ids are skipped; duplicated ids yield duplicated rows.
pub async fn get_tracks_by_ids(pool: &SqlitePool, ids: &[TrackId]) -> Result<Vec<Track>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id IN ({placeholders})");
    let mut query = sqlx::query_as::<_, Track>(&sql);
    for id in ids {
        query = query.bind(*id);
    }
    let rows = query.fetch_all(pool).await?;

    let by_id: HashMap<TrackId, Track> = rows.into_iter().map(|t| (t.id, t)).collect();
    Ok(ids.iter().filter_map(|id| by_id.get(id).cloned()).collect())
}

/// Apply a partial update. Only the `Some` fields of `update` change.
///
/// # Returns
///
/// Whether a row with this id existed.
pub async fn update_track(pool: &SqlitePool, id: TrackId, update: &TrackUpdate) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE tracks SET
            title = COALESCE(?, title),
            album = COALESCE(?, album),
            artist = COALESCE(?, artist),
            duration_ms = COALESCE(?, duration_ms),
            artwork = COALESCE(?, artwork),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&update.title)
    .bind(&update.album)
    .bind(&update.artist)
    .bind(update.duration_ms)
    .bind(&update.artwork)
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Load the persisted queue, if any.
pub async fn load_snapshot(pool: &SqlitePool) -> Result<Option<QueueSnapshot>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT snapshot FROM playback_state WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    match row {
        Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Persist the queue, replacing any previous snapshot.
pub async fn save_snapshot(pool: &SqlitePool, snapshot: &QueueSnapshot) -> Result<()> {
    let json = serde_json::to_string(snapshot)?;
    sqlx::query(
        r#"
        INSERT INTO playback_state (id, snapshot, saved_at) VALUES (1, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            snapshot = excluded.snapshot,
            saved_at = excluded.saved_at
        "#,
    )
    .bind(json)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================================
// Track store abstraction
// ============================================================================

/// Read/update access to track rows and the persisted queue.
///
/// Implement this trait to substitute an in-memory store in tests.
#[async_trait]
pub trait TrackStore: Send + Sync {
    async fn get_track(&self, id: TrackId) -> Result<Option<Track>>;

    async fn insert_track(&self, uri: &str) -> Result<TrackId>;

    /// Tracks in request order; unknown ids are skipped.
    async fn get_tracks(&self, ids: &[TrackId]) -> Result<Vec<Track>>;

    /// Returns false when no row has this id.
    async fn update_track(&self, id: TrackId, update: &TrackUpdate) -> Result<bool>;

    async fn load_snapshot(&self) -> Result<Option<QueueSnapshot>>;

    async fn save_snapshot(&self, snapshot: &QueueSnapshot) -> Result<()>;
}

/// [`TrackStore`] backed by the SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteTrackStore {
    pool: SqlitePool,
}

impl SqliteTrackStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TrackStore for SqliteTrackStore {
    async fn get_track(&self, id: TrackId) -> Result<Option<Track>> {
        get_track_by_id(&self.pool, id).await
    }

    async fn insert_track(&self, uri: &str) -> Result<TrackId> {
        insert_track(&self.pool, uri).await
    }

    async fn get_tracks(&self, ids: &[TrackId]) -> Result<Vec<Track>> {
        get_tracks_by_ids(&self.pool, ids).await
    }

    async fn update_track(&self, id: TrackId, update: &TrackUpdate) -> Result<bool> {
        update_track(&self.pool, id, update).await
    }

    async fn load_snapshot(&self) -> Result<Option<QueueSnapshot>> {
        load_snapshot(&self.pool).await
    }

    async fn save_snapshot(&self, snapshot: &QueueSnapshot) -> Result<()> {
        save_snapshot(&self.pool, snapshot).await
    }
}

/// Per-track write serialization for the metadata workers.
///
/// The batch probe and the live poller may both want to write the same row;
/// holding the guard for a track id orders those writes.
#[derive(Debug, Clone, Default)]
pub struct WriteLocks {
    locks: Arc<Mutex<HashMap<TrackId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl WriteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to one track row.
    pub async fn lock(&self, id: TrackId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // Forget entries nobody else is holding
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    /// Run an update while holding the track's write lock.
    pub async fn update(
        &self,
        store: &dyn TrackStore,
        id: TrackId,
        update: &TrackUpdate,
    ) -> Result<bool> {
        let _guard = self.lock(id).await;
        store.update_track(id, update).await
    }
}
