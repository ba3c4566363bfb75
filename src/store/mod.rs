//! Timeline metadata stores.
//!
//! One contract, two backends: a volatile in-memory store and a durable
//! SQLite store. The backend is chosen once at process start from
//! configuration; a process never mixes the two.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::domain::{Event, EventPatch, NewEvent, Timeline};

/// Errors from the metadata stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Timeline not found: {0}")]
    TimelineNotFound(i64),

    #[error("Event not found: {0}")]
    EventNotFound(i64),

    /// The durable backend requires a non-null owner for every timeline.
    #[error("This backend requires an owner for new timelines")]
    OwnerRequired,

    /// The volatile id scheme supports at most `limit` events per timeline.
    #[error("Timeline {timeline_id} is full: at most {limit} events per timeline")]
    EventLimit { timeline_id: i64, limit: i64 },

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The authoritative store for timelines and events.
///
/// `append_event` computes the next event number as `max(existing) + 1`
/// atomically with the write, so concurrent appends against one timeline
/// never produce duplicate numbers.
#[async_trait]
pub trait TimelineStore: Send + Sync {
    /// Whether writes survive a process restart.
    fn is_durable(&self) -> bool;

    /// Create a new, empty timeline.
    async fn create_timeline(
        &self,
        owner_id: Option<i64>,
        device_id: Option<String>,
    ) -> Result<Timeline, StoreError>;

    /// Append one event, assigning the next event number.
    async fn append_event(&self, timeline_id: i64, event: NewEvent)
        -> Result<Event, StoreError>;

    /// Insert an event with a caller-supplied number (bulk generate path).
    /// The number is trusted as-is and not required to be contiguous.
    async fn insert_event_numbered(
        &self,
        timeline_id: i64,
        event_number: i64,
        event: NewEvent,
    ) -> Result<Event, StoreError>;

    async fn get_timeline(&self, id: i64) -> Result<Timeline, StoreError>;

    /// Events of a timeline, ordered by event number ascending.
    async fn get_events(&self, timeline_id: i64) -> Result<Vec<Event>, StoreError>;

    async fn get_event(&self, event_id: i64) -> Result<Event, StoreError>;

    /// Update presentation fields of an event. Id, timeline id, event number
    /// and artifact path are never editable through this path.
    async fn update_event(&self, event_id: i64, patch: EventPatch)
        -> Result<Event, StoreError>;
}

/// Warn when an event is committed whose artifact is already gone.
/// The commit still proceeds; the gap is flagged, not hidden.
pub(crate) fn check_artifact_exists(audio_file_path: &str) {
    if !std::path::Path::new(audio_file_path).is_file() {
        tracing::warn!(
            path = %audio_file_path,
            "Audio artifact missing at commit time"
        );
    }
}
