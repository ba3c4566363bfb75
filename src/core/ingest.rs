//! Ingestion service: validate, persist the artifact, run the pipeline,
//! commit the resulting event.
//!
//! Commit routing depends on the backend and the caller:
//! - volatile backend: every caller commits to the in-memory store
//! - durable backend, authenticated: committed under the caller's account
//! - durable backend, anonymous: nothing is written; the caller receives a
//!   draft result it must hold on to itself
//!
//! A persistence failure after transcription also degrades to a draft result
//! rather than discarding the pipeline's work; the artifact stays on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::core::pipeline::{
    recorded_time_label, recording_start_time, PipelineOutput, TranscriptionPipeline,
};
use crate::domain::{CallerContext, Event, NewEvent, Timeline, TimelineRef};
use crate::error::{Result, ServiceError};
use crate::store::{StoreError, TimelineStore};

/// Upload size cap.
pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Extensions recognized as audio; anything else is stored as `.bin`.
const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "ogg", "m4a", "bin"];

pub const MSG_TRANSCRIBED: &str = "Audio transcribed successfully";
pub const WARN_NOT_PERSISTED: &str =
    "Timeline was not persisted; keep this draft result client-side";
pub const WARN_TIMELINE_REPLACED: &str =
    "Requested timeline no longer exists; a new timeline was created";

/// A received audio upload, already buffered in memory.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Result of one ingestion. `timeline_id` is a stored id or a draft id,
/// depending on where the commit landed.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub message: String,
    pub timeline_id: TimelineRef,
    pub recording_start_time: DateTime<Utc>,
    pub events: Vec<Event>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// One row of a bulk timeline-generation request. Event numbers are supplied
/// by the caller and trusted as-is.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateEvent {
    pub event_number: i64,
    pub time: String,
    #[serde(default)]
    pub transcript: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub audio_file_path: String,
    #[serde(default)]
    pub audio_duration_ms: i64,
}

/// Where a processed recording should be committed.
enum CommitTarget {
    NewTimeline { device_id: Option<String> },
    Existing(i64),
}

/// Drives uploads through validation, the pipeline, and the store.
pub struct IngestionService {
    config: Config,
    pipeline: TranscriptionPipeline,
    store: Arc<dyn TimelineStore>,
}

impl IngestionService {
    pub fn new(
        config: Config,
        pipeline: TranscriptionPipeline,
        store: Arc<dyn TimelineStore>,
    ) -> Self {
        Self {
            config,
            pipeline,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn TimelineStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ingest an upload into a brand-new timeline.
    #[instrument(skip_all, fields(file = ?upload.file_name))]
    pub async fn ingest(
        &self,
        upload: Upload,
        caller: CallerContext,
        model: Option<&str>,
        location: Option<(f64, f64)>,
        device_id: Option<String>,
    ) -> Result<IngestOutcome> {
        let artifact = self.save_upload(&upload).await?;
        self.process_and_commit(
            artifact,
            caller,
            model,
            location,
            CommitTarget::NewTimeline { device_id },
        )
        .await
    }

    /// Ingest an upload as the next event of an existing timeline.
    #[instrument(skip_all, fields(timeline_id, file = ?upload.file_name))]
    pub async fn append(
        &self,
        timeline_id: i64,
        upload: Upload,
        caller: CallerContext,
        model: Option<&str>,
        location: Option<(f64, f64)>,
    ) -> Result<IngestOutcome> {
        if self.store.is_durable() {
            // Ownership is checked before any expensive work.
            let timeline = self.store.get_timeline(timeline_id).await?;
            check_owner(&timeline, caller)?;
        }

        let artifact = self.save_upload(&upload).await?;
        self.process_and_commit(
            artifact,
            caller,
            model,
            location,
            CommitTarget::Existing(timeline_id),
        )
        .await
    }

    /// Ingest a file already on this host, confined to the configured base
    /// directory. Paths resolving outside the base are rejected before any
    /// processing.
    #[instrument(skip(self, caller))]
    pub async fn ingest_from_local(
        &self,
        raw_path: &str,
        caller: CallerContext,
        model: Option<&str>,
    ) -> Result<IngestOutcome> {
        let artifact = self.resolve_local_path(raw_path)?;
        self.process_and_commit(
            artifact,
            caller,
            model,
            None,
            CommitTarget::NewTimeline { device_id: None },
        )
        .await
    }

    /// Create a whole timeline from caller-supplied events in one call.
    /// Durable backend and an authenticated caller are both required; this
    /// path never produces drafts.
    #[instrument(skip_all, fields(events = events.len()))]
    pub async fn generate(
        &self,
        caller: CallerContext,
        device_id: Option<String>,
        events: Vec<GenerateEvent>,
    ) -> Result<IngestOutcome> {
        if !self.store.is_durable() {
            return Err(ServiceError::Validation(
                "Timeline generation requires the durable backend".to_string(),
            ));
        }
        if !caller.is_authenticated() {
            return Err(ServiceError::Forbidden);
        }
        if events.is_empty() {
            return Err(ServiceError::Validation(
                "At least one event is required".to_string(),
            ));
        }

        let timeline = self
            .store
            .create_timeline(caller.user_id, device_id)
            .await?;

        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            let new_event = NewEvent {
                time: event.time,
                transcript: event.transcript,
                latitude: event.latitude,
                longitude: event.longitude,
                audio_file_path: event.audio_file_path,
                audio_duration_ms: event.audio_duration_ms,
                recording_start_time: None,
            };
            stored.push(
                self.store
                    .insert_event_numbered(timeline.id, event.event_number, new_event)
                    .await?,
            );
        }

        info!(timeline_id = timeline.id, events = stored.len(), "Generated timeline");
        Ok(IngestOutcome {
            message: "Timeline generated successfully".to_string(),
            timeline_id: TimelineRef::Stored(timeline.id),
            recording_start_time: timeline.date_generated,
            events: stored,
            warning: None,
        })
    }

    /// Validate and write the upload into the uploads directory.
    async fn save_upload(&self, upload: &Upload) -> Result<PathBuf> {
        if upload.bytes.is_empty() {
            return Err(ServiceError::Validation(
                "No audio file provided".to_string(),
            ));
        }
        if upload.bytes.len() > MAX_UPLOAD_BYTES {
            return Err(ServiceError::Validation(format!(
                "File too large: limit is {} bytes",
                MAX_UPLOAD_BYTES
            )));
        }
        let recognized_ext = upload
            .file_name
            .as_deref()
            .and_then(|name| Path::new(name).extension())
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .filter(|e| AUDIO_EXTENSIONS.contains(&e.as_str()));

        // Either signal is enough to accept: recorders on some platforms
        // mislabel their uploads (or send octet-stream), so a recognized
        // extension rescues a non-audio content type and vice versa. Reject
        // only when both fail.
        let audio_like_type = match upload.content_type.as_deref() {
            Some(ct) => ct.starts_with("audio/") || ct == "application/octet-stream",
            None => true,
        };
        if !audio_like_type && recognized_ext.is_none() {
            return Err(ServiceError::Validation(format!(
                "Unsupported content type: {}",
                upload.content_type.as_deref().unwrap_or("unknown")
            )));
        }

        let ext = recognized_ext.unwrap_or_else(|| "bin".to_string());

        let file_name = format!(
            "audio-{}-{}.{}",
            Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4().simple(),
            ext
        );
        let path = self.config.uploads_dir.join(file_name);

        tokio::fs::write(&path, &upload.bytes)
            .await
            .map_err(|e| ServiceError::Persistence(format!("Failed to store upload: {e}")))?;

        info!(path = %path.display(), bytes = upload.bytes.len(), "Stored upload");
        Ok(path)
    }

    /// Resolve a caller-supplied relative path against the local audio base,
    /// rejecting anything that escapes it.
    fn resolve_local_path(&self, raw: &str) -> Result<PathBuf> {
        if raw.trim().is_empty() {
            return Err(ServiceError::Validation(
                "No audio path provided".to_string(),
            ));
        }

        let base = self
            .config
            .local_audio_base
            .canonicalize()
            .map_err(|e| ServiceError::Validation(format!("Audio base unavailable: {e}")))?;

        let resolved = base
            .join(raw)
            .canonicalize()
            .map_err(|_| ServiceError::Validation(format!("Audio file not found: {raw}")))?;

        if !resolved.starts_with(&base) {
            warn!(path = raw, "Rejected path escaping the audio base");
            return Err(ServiceError::Validation(
                "Invalid audio path".to_string(),
            ));
        }
        if !resolved.is_file() {
            return Err(ServiceError::Validation(format!(
                "Audio file not found: {raw}"
            )));
        }

        Ok(resolved)
    }

    /// Pipeline plus commit. By this point the artifact is on disk and stays
    /// there whatever happens next.
    async fn process_and_commit(
        &self,
        artifact: PathBuf,
        caller: CallerContext,
        model: Option<&str>,
        location: Option<(f64, f64)>,
        target: CommitTarget,
    ) -> Result<IngestOutcome> {
        let output = self.pipeline.process(&artifact, model).await;
        // The filtered artifact is the one events reference from here on;
        // when filtering degraded to passthrough it is the upload itself.
        let start = recording_start_time(&output.filtered_audio_path).await;
        let new_event = event_for_commit(output, start, location);

        match target {
            CommitTarget::NewTimeline { device_id } => {
                self.commit_new_timeline(caller, device_id, new_event, start)
                    .await
            }
            CommitTarget::Existing(timeline_id) => {
                self.commit_append(timeline_id, caller, new_event, start)
                    .await
            }
        }
    }

    async fn commit_new_timeline(
        &self,
        caller: CallerContext,
        device_id: Option<String>,
        new_event: NewEvent,
        start: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        if self.store.is_durable() && !caller.is_authenticated() {
            return Ok(draft_outcome(new_event, start, WARN_NOT_PERSISTED));
        }

        let committed: std::result::Result<_, StoreError> = async {
            let timeline = self
                .store
                .create_timeline(caller.user_id, device_id)
                .await?;
            let event = self.store.append_event(timeline.id, new_event.clone()).await?;
            Ok((timeline.id, event))
        }
        .await;

        match committed {
            Ok((timeline_id, event)) => Ok(IngestOutcome {
                message: MSG_TRANSCRIBED.to_string(),
                timeline_id: TimelineRef::Stored(timeline_id),
                recording_start_time: start,
                events: vec![event],
                warning: None,
            }),
            Err(e) => {
                warn!(error = %e, "Commit failed; returning draft result");
                Ok(draft_outcome(new_event, start, WARN_NOT_PERSISTED))
            }
        }
    }

    async fn commit_append(
        &self,
        timeline_id: i64,
        caller: CallerContext,
        new_event: NewEvent,
        start: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        match self.store.append_event(timeline_id, new_event.clone()).await {
            Ok(event) => Ok(IngestOutcome {
                message: MSG_TRANSCRIBED.to_string(),
                timeline_id: TimelineRef::Stored(timeline_id),
                recording_start_time: start,
                events: vec![event],
                warning: None,
            }),
            // Volatile backend: the requested timeline evaporated in a
            // restart. Self-heal into a fresh timeline instead of failing
            // the upload.
            Err(StoreError::TimelineNotFound(_)) if !self.store.is_durable() => {
                warn!(timeline_id, "Timeline missing; creating a replacement");
                let timeline = self.store.create_timeline(caller.user_id, None).await?;
                let event = self.store.append_event(timeline.id, new_event).await?;
                Ok(IngestOutcome {
                    message: MSG_TRANSCRIBED.to_string(),
                    timeline_id: TimelineRef::Stored(timeline.id),
                    recording_start_time: start,
                    events: vec![event],
                    warning: Some(WARN_TIMELINE_REPLACED.to_string()),
                })
            }
            Err(e @ (StoreError::TimelineNotFound(_) | StoreError::EventLimit { .. })) => {
                Err(e.into())
            }
            Err(e) => {
                warn!(error = %e, timeline_id, "Append failed; returning draft result");
                Ok(draft_outcome(new_event, start, WARN_NOT_PERSISTED))
            }
        }
    }
}

/// Fold pipeline output into the event row to commit. Playback and recovery
/// both follow `audio_file_path`, so it must point at the artifact the
/// pipeline actually produced.
fn event_for_commit(
    output: PipelineOutput,
    start: DateTime<Utc>,
    location: Option<(f64, f64)>,
) -> NewEvent {
    NewEvent {
        time: recorded_time_label(start),
        transcript: output.full_text,
        latitude: location.map(|(lat, _)| lat),
        longitude: location.map(|(_, lon)| lon),
        audio_file_path: output.filtered_audio_path.to_string_lossy().into_owned(),
        audio_duration_ms: output.audio_duration_ms,
        recording_start_time: Some(start),
    }
}

fn check_owner(timeline: &Timeline, caller: CallerContext) -> Result<()> {
    match (timeline.owner_id, caller.user_id) {
        (Some(owner), Some(user)) if owner == user => Ok(()),
        _ => Err(ServiceError::Forbidden),
    }
}

/// Build an unpersisted result the caller must hold itself. Ids are zeroed:
/// nothing in any store corresponds to this event.
fn draft_outcome(new_event: NewEvent, start: DateTime<Utc>, warning: &str) -> IngestOutcome {
    let now = Utc::now();
    let event = Event {
        id: 0,
        timeline_id: 0,
        event_number: 1,
        time: new_event.time,
        transcript: new_event.transcript,
        latitude: new_event.latitude,
        longitude: new_event.longitude,
        audio_file_path: new_event.audio_file_path,
        audio_duration_ms: new_event.audio_duration_ms,
        created_at: now,
        updated_at: now,
    };
    IngestOutcome {
        message: MSG_TRANSCRIBED.to_string(),
        timeline_id: TimelineRef::draft(),
        recording_start_time: start,
        events: vec![event],
        warning: Some(warning.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ToolInvoker;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn service_in(dir: &Path) -> IngestionService {
        let data_dir = dir.to_path_buf();
        let uploads_dir = data_dir.join("uploads");
        let filtered_dir = uploads_dir.join("filtered");
        std::fs::create_dir_all(&filtered_dir).unwrap();

        let config = Config {
            local_audio_base: uploads_dir.clone(),
            uploads_dir,
            filtered_dir: filtered_dir.clone(),
            data_dir,
            scripts_dir: dir.join("scripts"),
            db_path: None,
            python_override: None,
            whisper_model: "base".to_string(),
            tool_timeout: Duration::from_secs(5),
        };

        let invoker = Arc::new(ToolInvoker::new(
            config.scripts_dir.clone(),
            filtered_dir,
            config.tool_timeout,
            None,
        ));
        let pipeline = TranscriptionPipeline::new(invoker, config.whisper_model.clone());
        IngestionService::new(config, pipeline, Arc::new(MemoryStore::new()))
    }

    fn wav_upload() -> Upload {
        Upload {
            file_name: Some("clip.wav".to_string()),
            content_type: Some("audio/wav".to_string()),
            bytes: Bytes::from_static(b"RIFF0000WAVE"),
        }
    }

    #[tokio::test]
    async fn test_rejects_empty_upload() {
        let temp = tempfile::TempDir::new().unwrap();
        let service = service_in(temp.path());

        let upload = Upload {
            file_name: None,
            content_type: None,
            bytes: Bytes::new(),
        };
        let err = service
            .ingest(upload, CallerContext::anonymous(), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_rejects_non_audio_content_type() {
        let temp = tempfile::TempDir::new().unwrap();
        let service = service_in(temp.path());

        let upload = Upload {
            file_name: Some("notes.txt".to_string()),
            content_type: Some("text/plain".to_string()),
            bytes: Bytes::from_static(b"hello"),
        };
        let err = service
            .ingest(upload, CallerContext::anonymous(), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_allowed_extension_rescues_mislabeled_type() {
        let temp = tempfile::TempDir::new().unwrap();
        let service = service_in(temp.path());

        let upload = Upload {
            file_name: Some("clip.wav".to_string()),
            content_type: Some("video/mp4".to_string()),
            bytes: Bytes::from_static(b"RIFF0000WAVE"),
        };
        let path = service.save_upload(&upload).await.unwrap();
        assert_eq!(path.extension().unwrap(), "wav");
        assert!(path.is_file());
    }

    #[test]
    fn test_committed_event_references_filtered_artifact() {
        let output = PipelineOutput {
            segments: vec![],
            full_text: "hello there".to_string(),
            language: "en".to_string(),
            filtered_audio_path: PathBuf::from("/data/uploads/filtered/filtered-42.wav"),
            audio_duration_ms: 1200,
        };
        let start = Utc::now();

        let event = event_for_commit(output, start, Some((51.5, -0.12)));
        assert_eq!(
            event.audio_file_path,
            "/data/uploads/filtered/filtered-42.wav"
        );
        assert_eq!(event.transcript, "hello there");
        assert_eq!(event.audio_duration_ms, 1200);
        assert_eq!(event.recording_start_time, Some(start));
        assert_eq!(event.latitude, Some(51.5));
    }

    #[tokio::test]
    async fn test_unknown_extension_stored_as_bin() {
        let temp = tempfile::TempDir::new().unwrap();
        let service = service_in(temp.path());

        let upload = Upload {
            file_name: Some("clip.flac".to_string()),
            content_type: Some("application/octet-stream".to_string()),
            bytes: Bytes::from_static(b"fLaC"),
        };
        let path = service.save_upload(&upload).await.unwrap();
        assert_eq!(path.extension().unwrap(), "bin");
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn test_volatile_ingest_commits_event() {
        let temp = tempfile::TempDir::new().unwrap();
        let service = service_in(temp.path());

        let outcome = service
            .ingest(wav_upload(), CallerContext::anonymous(), None, Some((51.5, -0.12)), None)
            .await
            .unwrap();

        assert_eq!(outcome.message, MSG_TRANSCRIBED);
        assert_eq!(outcome.timeline_id, TimelineRef::Stored(1));
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].event_number, 1);
        assert_eq!(outcome.events[0].latitude, Some(51.5));
        assert!(outcome.warning.is_none());
        // No transcription tooling in the test environment.
        assert_eq!(
            outcome.events[0].transcript,
            crate::adapters::PLACEHOLDER_SCRIPT_MISSING
        );
    }

    #[tokio::test]
    async fn test_volatile_append_self_heals() {
        let temp = tempfile::TempDir::new().unwrap();
        let service = service_in(temp.path());

        let outcome = service
            .append(42, wav_upload(), CallerContext::anonymous(), None, None)
            .await
            .unwrap();

        assert_eq!(outcome.timeline_id, TimelineRef::Stored(1));
        assert_eq!(outcome.warning.as_deref(), Some(WARN_TIMELINE_REPLACED));
    }

    #[tokio::test]
    async fn test_local_path_traversal_rejected() {
        let temp = tempfile::TempDir::new().unwrap();
        let service = service_in(temp.path());

        let err = service
            .ingest_from_local("../../etc/passwd", CallerContext::anonymous(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_local_ingest_within_base() {
        let temp = tempfile::TempDir::new().unwrap();
        let service = service_in(temp.path());

        let local = service.config.local_audio_base.join("session.wav");
        tokio::fs::write(&local, b"RIFF").await.unwrap();

        let outcome = service
            .ingest_from_local("session.wav", CallerContext::anonymous(), None)
            .await
            .unwrap();
        assert_eq!(outcome.events.len(), 1);
        assert!(outcome.events[0].audio_file_path.ends_with("session.wav"));
    }

    #[tokio::test]
    async fn test_generate_requires_durable_backend() {
        let temp = tempfile::TempDir::new().unwrap();
        let service = service_in(temp.path());

        let err = service
            .generate(CallerContext::user(1), None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}
