//! Volatile in-memory store.
//!
//! Holds all timelines and events in process memory behind one async mutex;
//! counters are seeded at construction and nothing survives a restart. This
//! is a documented data-loss characteristic: audio artifacts on disk outlive
//! the metadata that referenced them, which is why the recovery resolver
//! exists.
//!
//! Event ids are derived from the timeline id so that an id presented after
//! a restart still encodes its probable timeline and event number:
//! `event_id = timeline_id * 1000 + (event_number - 1)`. The multiplier
//! bounds a timeline at 999 events; appends past that are rejected rather
//! than letting ids bleed into the next timeline's block.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{Event, EventPatch, NewEvent, Timeline};

use super::{check_artifact_exists, StoreError, TimelineStore};

/// Events-per-timeline block width of the derived id scheme.
pub const EVENT_ID_BLOCK: i64 = 1000;

/// Maximum events one timeline can hold under the derived id scheme.
pub const MAX_EVENTS_PER_TIMELINE: i64 = 999;

/// Decode a derived event id into its probable (timeline id, event number).
/// Diagnostic only: after a restart nothing guarantees the event still exists.
pub fn decode_event_id(event_id: i64) -> (i64, i64) {
    (event_id / EVENT_ID_BLOCK, event_id % EVENT_ID_BLOCK + 1)
}

#[derive(Default)]
struct Inner {
    next_timeline_id: i64,
    timelines: HashMap<i64, Timeline>,
    /// Events per timeline, kept ordered by event number.
    events: HashMap<i64, Vec<Event>>,
}

/// In-memory metadata store. Created once at process start, discarded at
/// process end.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_timeline_id: 1,
                timelines: HashMap::new(),
                events: HashMap::new(),
            }),
        }
    }

    fn build_event(
        timeline: &mut Timeline,
        event_number: i64,
        event: NewEvent,
    ) -> Event {
        let now = Utc::now();
        let id = timeline.id * EVENT_ID_BLOCK + (event_number - 1);

        check_artifact_exists(&event.audio_file_path);

        // Recording start is set by the first event that carries one and
        // never overwritten by later appends.
        if timeline.recording_start_time.is_none() {
            timeline.recording_start_time = event.recording_start_time;
        }
        timeline.updated_at = now;

        Event {
            id,
            timeline_id: timeline.id,
            event_number,
            time: event.time,
            transcript: event.transcript,
            latitude: event.latitude,
            longitude: event.longitude,
            audio_file_path: event.audio_file_path,
            audio_duration_ms: event.audio_duration_ms,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl TimelineStore for MemoryStore {
    fn is_durable(&self) -> bool {
        false
    }

    async fn create_timeline(
        &self,
        owner_id: Option<i64>,
        device_id: Option<String>,
    ) -> Result<Timeline, StoreError> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_timeline_id;
        inner.next_timeline_id += 1;

        let now = Utc::now();
        let timeline = Timeline {
            id,
            owner_id,
            device_id,
            date_generated: now,
            recording_start_time: None,
            created_at: now,
            updated_at: now,
        };
        inner.timelines.insert(id, timeline.clone());
        inner.events.insert(id, Vec::new());

        debug!(timeline_id = id, "Created volatile timeline");
        Ok(timeline)
    }

    async fn append_event(
        &self,
        timeline_id: i64,
        event: NewEvent,
    ) -> Result<Event, StoreError> {
        let mut inner = self.inner.lock().await;
        let Inner {
            timelines, events, ..
        } = &mut *inner;

        let timeline = timelines
            .get_mut(&timeline_id)
            .ok_or(StoreError::TimelineNotFound(timeline_id))?;
        let list = events.entry(timeline_id).or_default();

        let event_number = list.last().map(|e| e.event_number).unwrap_or(0) + 1;
        if event_number > MAX_EVENTS_PER_TIMELINE {
            return Err(StoreError::EventLimit {
                timeline_id,
                limit: MAX_EVENTS_PER_TIMELINE,
            });
        }

        let stored = Self::build_event(timeline, event_number, event);
        list.push(stored.clone());
        Ok(stored)
    }

    async fn insert_event_numbered(
        &self,
        timeline_id: i64,
        event_number: i64,
        event: NewEvent,
    ) -> Result<Event, StoreError> {
        if !(1..=MAX_EVENTS_PER_TIMELINE).contains(&event_number) {
            return Err(StoreError::EventLimit {
                timeline_id,
                limit: MAX_EVENTS_PER_TIMELINE,
            });
        }

        let mut inner = self.inner.lock().await;
        let Inner {
            timelines, events, ..
        } = &mut *inner;

        let timeline = timelines
            .get_mut(&timeline_id)
            .ok_or(StoreError::TimelineNotFound(timeline_id))?;
        let list = events.entry(timeline_id).or_default();

        let stored = Self::build_event(timeline, event_number, event);
        list.push(stored.clone());
        list.sort_by_key(|e| e.event_number);
        Ok(stored)
    }

    async fn get_timeline(&self, id: i64) -> Result<Timeline, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .timelines
            .get(&id)
            .cloned()
            .ok_or(StoreError::TimelineNotFound(id))
    }

    async fn get_events(&self, timeline_id: i64) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .events
            .get(&timeline_id)
            .cloned()
            .ok_or(StoreError::TimelineNotFound(timeline_id))
    }

    async fn get_event(&self, event_id: i64) -> Result<Event, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .events
            .values()
            .flatten()
            .find(|e| e.id == event_id)
            .cloned()
            .ok_or(StoreError::EventNotFound(event_id))
    }

    async fn update_event(
        &self,
        event_id: i64,
        patch: EventPatch,
    ) -> Result<Event, StoreError> {
        let mut inner = self.inner.lock().await;
        let event = inner
            .events
            .values_mut()
            .flatten()
            .find(|e| e.id == event_id)
            .ok_or(StoreError::EventNotFound(event_id))?;

        if let Some(time) = patch.time {
            event.time = time;
        }
        if let Some(transcript) = patch.transcript {
            event.transcript = transcript;
        }
        if let Some(latitude) = patch.latitude {
            event.latitude = Some(latitude);
        }
        if let Some(longitude) = patch.longitude {
            event.longitude = Some(longitude);
        }
        event.updated_at = Utc::now();

        Ok(event.clone())
    }
}
