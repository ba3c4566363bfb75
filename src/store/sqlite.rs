//! Durable SQLite-backed store.
//!
//! Every create/append is a transactional write keyed by auto-generated
//! primary keys. Ownership is enforced through the NOT NULL owner column:
//! anonymous ingestion must go through the volatile store or a client-held
//! draft instead.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{Event, EventPatch, NewEvent, Timeline};

use super::{check_artifact_exists, StoreError, TimelineStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT UNIQUE NOT NULL,
    email TEXT UNIQUE NOT NULL,
    password_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sign_in_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER,
    username TEXT,
    success INTEGER DEFAULT 0,
    ip_address TEXT,
    user_agent TEXT,
    attempted_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS timelines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    device_id TEXT,
    date_generated TEXT NOT NULL,
    recording_start_time TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timeline_id INTEGER NOT NULL,
    event_number INTEGER NOT NULL,
    time TEXT NOT NULL,
    transcript TEXT,
    latitude REAL,
    longitude REAL,
    audio_file_path TEXT,
    audio_duration_ms INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (timeline_id) REFERENCES timelines(id) ON DELETE CASCADE
);
";

/// Durable metadata store over a single guarded SQLite connection.
///
/// The connection mutex plus per-append transactions serialize the
/// read-next-number-then-insert sequence across concurrent requests.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "Opened timeline database");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn timeline_from_row(row: &Row<'_>) -> rusqlite::Result<Timeline> {
        Ok(Timeline {
            id: row.get("id")?,
            owner_id: row.get("user_id")?,
            device_id: row.get("device_id")?,
            date_generated: parse_ts(&row.get::<_, String>("date_generated")?),
            recording_start_time: row
                .get::<_, Option<String>>("recording_start_time")?
                .map(|s| parse_ts(&s)),
            created_at: parse_ts(&row.get::<_, String>("created_at")?),
            updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
        })
    }

    fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
        Ok(Event {
            id: row.get("id")?,
            timeline_id: row.get("timeline_id")?,
            event_number: row.get("event_number")?,
            time: row.get("time")?,
            transcript: row.get::<_, Option<String>>("transcript")?.unwrap_or_default(),
            latitude: row.get("latitude")?,
            longitude: row.get("longitude")?,
            audio_file_path: row
                .get::<_, Option<String>>("audio_file_path")?
                .unwrap_or_default(),
            audio_duration_ms: row
                .get::<_, Option<i64>>("audio_duration_ms")?
                .unwrap_or(0),
            created_at: parse_ts(&row.get::<_, String>("created_at")?),
            updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
        })
    }

    fn insert_event_tx(
        conn: &mut Connection,
        timeline_id: i64,
        event_number: Option<i64>,
        event: NewEvent,
    ) -> Result<Event, StoreError> {
        check_artifact_exists(&event.audio_file_path);

        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM timelines WHERE id = ?1",
                params![timeline_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::TimelineNotFound(timeline_id));
        }

        let event_number = match event_number {
            Some(n) => n,
            None => tx.query_row(
                "SELECT COALESCE(MAX(event_number), 0) + 1 FROM events WHERE timeline_id = ?1",
                params![timeline_id],
                |row| row.get(0),
            )?,
        };

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO events (timeline_id, event_number, time, transcript, latitude,
                                 longitude, audio_file_path, audio_duration_ms,
                                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                timeline_id,
                event_number,
                event.time,
                event.transcript,
                event.latitude,
                event.longitude,
                event.audio_file_path,
                event.audio_duration_ms,
                now,
            ],
        )?;
        let event_id = tx.last_insert_rowid();

        // First recording start wins; later appends never overwrite it.
        if let Some(start) = event.recording_start_time {
            tx.execute(
                "UPDATE timelines SET recording_start_time = ?1, updated_at = ?2
                 WHERE id = ?3 AND recording_start_time IS NULL",
                params![start.to_rfc3339(), now, timeline_id],
            )?;
        }

        let stored = tx.query_row(
            "SELECT * FROM events WHERE id = ?1",
            params![event_id],
            Self::event_from_row,
        )?;

        tx.commit()?;
        debug!(timeline_id, event_id, event_number, "Committed event");
        Ok(stored)
    }
}

#[async_trait]
impl TimelineStore for SqliteStore {
    fn is_durable(&self) -> bool {
        true
    }

    async fn create_timeline(
        &self,
        owner_id: Option<i64>,
        device_id: Option<String>,
    ) -> Result<Timeline, StoreError> {
        let owner_id = owner_id.ok_or(StoreError::OwnerRequired)?;

        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO timelines (user_id, device_id, date_generated, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3, ?3)",
            params![owner_id, device_id, now],
        )?;
        let id = conn.last_insert_rowid();

        conn.query_row(
            "SELECT * FROM timelines WHERE id = ?1",
            params![id],
            Self::timeline_from_row,
        )
        .map_err(StoreError::from)
    }

    async fn append_event(
        &self,
        timeline_id: i64,
        event: NewEvent,
    ) -> Result<Event, StoreError> {
        let mut conn = self.conn.lock().await;
        Self::insert_event_tx(&mut conn, timeline_id, None, event)
    }

    async fn insert_event_numbered(
        &self,
        timeline_id: i64,
        event_number: i64,
        event: NewEvent,
    ) -> Result<Event, StoreError> {
        let mut conn = self.conn.lock().await;
        Self::insert_event_tx(&mut conn, timeline_id, Some(event_number), event)
    }

    async fn get_timeline(&self, id: i64) -> Result<Timeline, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM timelines WHERE id = ?1",
            params![id],
            Self::timeline_from_row,
        )
        .optional()?
        .ok_or(StoreError::TimelineNotFound(id))
    }

    async fn get_events(&self, timeline_id: i64) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock().await;

        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM timelines WHERE id = ?1",
                params![timeline_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::TimelineNotFound(timeline_id));
        }

        let mut stmt = conn.prepare(
            "SELECT * FROM events WHERE timeline_id = ?1 ORDER BY event_number ASC",
        )?;
        let events = stmt
            .query_map(params![timeline_id], Self::event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    async fn get_event(&self, event_id: i64) -> Result<Event, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM events WHERE id = ?1",
            params![event_id],
            Self::event_from_row,
        )
        .optional()?
        .ok_or(StoreError::EventNotFound(event_id))
    }

    async fn update_event(
        &self,
        event_id: i64,
        patch: EventPatch,
    ) -> Result<Event, StoreError> {
        let conn = self.conn.lock().await;

        let current = conn
            .query_row(
                "SELECT * FROM events WHERE id = ?1",
                params![event_id],
                Self::event_from_row,
            )
            .optional()?
            .ok_or(StoreError::EventNotFound(event_id))?;

        let time = patch.time.unwrap_or(current.time);
        let transcript = patch.transcript.unwrap_or(current.transcript);
        let latitude = patch.latitude.or(current.latitude);
        let longitude = patch.longitude.or(current.longitude);
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "UPDATE events SET time = ?1, transcript = ?2, latitude = ?3, longitude = ?4,
                               updated_at = ?5
             WHERE id = ?6",
            params![time, transcript, latitude, longitude, now, event_id],
        )?;

        conn.query_row(
            "SELECT * FROM events WHERE id = ?1",
            params![event_id],
            Self::event_from_row,
        )
        .map_err(StoreError::from)
    }
}

/// Parse an RFC 3339 timestamp written by this store. Falls back to now on
/// corruption rather than failing the whole read.
fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!(value = s, error = %e, "Malformed timestamp in database");
            Utc::now()
        })
}
