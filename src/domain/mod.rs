//! Domain types for the timeline data model.
//!
//! A `Timeline` is an ordered collection of `Event`s produced from ingested
//! recordings. A `Segment` is the raw timed span emitted by the transcription
//! tool before it is folded into an event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single timed span of transcribed text, as produced by the transcription
/// tool. Timestamps are relative to recording start, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub start: f64,

    #[serde(default)]
    pub end: f64,

    #[serde(default)]
    pub text: String,
}

impl Segment {
    /// Placeholder segment used when transcription cannot produce real output.
    pub fn placeholder(reason: impl Into<String>) -> Self {
        Self {
            start: 0.0,
            end: 0.0,
            text: reason.into(),
        }
    }
}

/// An ordered collection of events attributed to one logical session/device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeline {
    pub id: i64,

    /// Owning user, when the timeline lives in the durable backend.
    pub owner_id: Option<i64>,

    pub device_id: Option<String>,

    pub date_generated: DateTime<Utc>,

    /// Wall-clock start of the first recording. Set by the first event and
    /// immutable thereafter.
    pub recording_start_time: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// One transcribed recording's metadata within a timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,

    pub timeline_id: i64,

    /// 1-based position within the timeline, strictly increasing.
    pub event_number: i64,

    /// Wall-clock recording time label, "HH:MM".
    pub time: String,

    pub transcript: String,

    pub latitude: Option<f64>,

    pub longitude: Option<f64>,

    /// Path to the stored audio artifact.
    pub audio_file_path: String,

    pub audio_duration_ms: i64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Data for an event about to be appended to a timeline. The store assigns
/// the id and event number.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub time: String,
    pub transcript: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub audio_file_path: String,
    pub audio_duration_ms: i64,

    /// Recording start for the whole timeline; applied only if the timeline
    /// does not have one yet.
    pub recording_start_time: Option<DateTime<Utc>>,
}

/// Partial update for an event. Only presentation fields are editable;
/// id, timeline id, event number and artifact path never change this way.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventPatch {
    pub time: Option<String>,
    pub transcript: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        self.time.is_none()
            && self.transcript.is_none()
            && self.latitude.is_none()
            && self.longitude.is_none()
    }
}

/// Reference to where an ingestion result landed: a stored timeline id, or a
/// client-held draft id when no durable write was possible or permitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TimelineRef {
    Stored(i64),
    Draft(String),
}

impl TimelineRef {
    pub fn draft() -> Self {
        Self::Draft(format!("draft-{}", uuid::Uuid::new_v4()))
    }
}

/// Identity of the caller, as asserted by the upstream collaborator that
/// owns authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerContext {
    pub user_id: Option<i64>,
}

impl CallerContext {
    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn user(id: i64) -> Self {
        Self { user_id: Some(id) }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}
