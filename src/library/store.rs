//! Persistence collaborator for imported and downloaded tracks.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::upstream::TrackMetadata;

const SCHEMA_VERSION: i64 = 1;

const CREATE_TRACKS: &str = "CREATE TABLE IF NOT EXISTS tracks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    artist TEXT NOT NULL,
    album TEXT NOT NULL,
    source TEXT NOT NULL,
    source_track_id TEXT NOT NULL,
    lyrics_path TEXT,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tracks_source_track ON tracks(source, source_track_id);";

/// A track row as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTrack {
    pub id: i64,
    pub metadata: TrackMetadata,
    pub file_path: PathBuf,
    pub lyrics_path: Option<PathBuf>,
}

pub trait TrackStore: Send + Sync {
    /// Insert or update the track stored at `file_path`.
    fn upsert_track(
        &self,
        metadata: &TrackMetadata,
        file_path: &Path,
        lyrics_path: Option<&Path>,
    ) -> Result<i64>;

    /// Look up a track by its upstream identity.
    fn get_track_by_source_track(&self, source_track_id: &str, source: &str)
        -> Result<Option<StoredTrack>>;

    fn get_track_by_path(&self, file_path: &Path) -> Result<Option<StoredTrack>>;

    fn count_tracks(&self) -> Result<usize>;
}

pub struct SqliteTrackStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTrackStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }
        let is_new_db = !path.exists();
        let conn = Connection::open(path).context("Failed to open track database")?;
        if is_new_db {
            info!("Creating new track database at {:?}", path);
        }
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            bail!(
                "Track database version {} is newer than supported version {}",
                version,
                SCHEMA_VERSION
            );
        }
        conn.execute_batch(CREATE_TRACKS)
            .context("Failed to create tracks table")?;
        conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("track database lock poisoned"))
    }

    fn row_to_track(row: &rusqlite::Row) -> rusqlite::Result<StoredTrack> {
        let file_path: String = row.get("file_path")?;
        let lyrics_path: Option<String> = row.get("lyrics_path")?;
        Ok(StoredTrack {
            id: row.get("id")?,
            metadata: TrackMetadata {
                title: row.get("title")?,
                artist: row.get("artist")?,
                album: row.get("album")?,
                source: row.get("source")?,
                source_track_id: row.get("source_track_id")?,
                pic_id: None,
            },
            file_path: PathBuf::from(file_path),
            lyrics_path: lyrics_path.map(PathBuf::from),
        })
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl TrackStore for SqliteTrackStore {
    fn upsert_track(
        &self,
        metadata: &TrackMetadata,
        file_path: &Path,
        lyrics_path: Option<&Path>,
    ) -> Result<i64> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let id = conn.query_row(
            "INSERT INTO tracks (file_path, title, artist, album, source, source_track_id, lyrics_path, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(file_path) DO UPDATE SET
                title = ?2, artist = ?3, album = ?4, source = ?5, source_track_id = ?6,
                lyrics_path = COALESCE(?7, lyrics_path), updated_at = ?8
             RETURNING id",
            params![
                path_text(file_path),
                metadata.title,
                metadata.artist,
                metadata.album,
                metadata.source,
                metadata.source_track_id,
                lyrics_path.map(path_text),
                now
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn get_track_by_source_track(
        &self,
        source_track_id: &str,
        source: &str,
    ) -> Result<Option<StoredTrack>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM tracks WHERE source_track_id = ?1 AND source = ?2 ORDER BY id LIMIT 1",
        )?;
        let track = stmt
            .query_row(params![source_track_id, source], Self::row_to_track)
            .optional()?;
        Ok(track)
    }

    fn get_track_by_path(&self, file_path: &Path) -> Result<Option<StoredTrack>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM tracks WHERE file_path = ?1")?;
        let track = stmt
            .query_row(params![path_text(file_path)], Self::row_to_track)
            .optional()?;
        Ok(track)
    }

    fn count_tracks(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
