//! End-to-end ingestion through the service layer, without the transcription
//! tooling installed: every flow degrades to the placeholder transcript but
//! still commits, routes, and labels events correctly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use echolog::adapters::{ToolInvoker, PLACEHOLDER_SCRIPT_MISSING};
use echolog::core::ingest::{MAX_UPLOAD_BYTES, WARN_NOT_PERSISTED};
use echolog::core::{IngestionService, TranscriptionPipeline, Upload};
use echolog::domain::{CallerContext, TimelineRef};
use echolog::store::{MemoryStore, SqliteStore, TimelineStore};
use echolog::{Config, ServiceError};

fn build_service(dir: &Path, store: Arc<dyn TimelineStore>) -> IngestionService {
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
    IngestionService::new(config, pipeline, store)
}

fn wav_upload() -> Upload {
    Upload {
        file_name: Some("clip.wav".to_string()),
        content_type: Some("audio/wav".to_string()),
        bytes: Bytes::from_static(b"RIFF0000WAVEfmt "),
    }
}

#[tokio::test]
async fn test_volatile_ingest_end_to_end() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let service = build_service(temp.path(), store.clone());

    let outcome = service
        .ingest(wav_upload(), CallerContext::anonymous(), None, None, None)
        .await
        .unwrap();

    let TimelineRef::Stored(timeline_id) = outcome.timeline_id else {
        panic!("expected a stored timeline");
    };

    assert_eq!(outcome.events.len(), 1);
    let event = &outcome.events[0];
    assert_eq!(event.event_number, 1);
    assert_eq!(event.transcript, PLACEHOLDER_SCRIPT_MISSING);

    // Wall-clock label in HH:MM.
    assert_eq!(event.time.len(), 5);
    assert_eq!(&event.time[2..3], ":");

    // The artifact was written and the committed path points at it.
    assert!(Path::new(&event.audio_file_path).is_file());

    // The timeline is resolvable and carries the recording start.
    let timeline = store.get_timeline(timeline_id).await.unwrap();
    assert!(timeline.recording_start_time.is_some());
}

#[tokio::test]
async fn test_durable_anonymous_ingest_yields_draft() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let service = build_service(temp.path(), store.clone());

    let outcome = service
        .ingest(wav_upload(), CallerContext::anonymous(), None, None, None)
        .await
        .unwrap();

    match &outcome.timeline_id {
        TimelineRef::Draft(id) => assert!(id.starts_with("draft-")),
        other => panic!("expected a draft, got {other:?}"),
    }
    assert_eq!(outcome.warning.as_deref(), Some(WARN_NOT_PERSISTED));

    // Nothing was written, but the artifact is retained on disk.
    assert!(store.get_timeline(1).await.is_err());
    assert!(Path::new(&outcome.events[0].audio_file_path).is_file());
}

#[tokio::test]
async fn test_durable_authenticated_ingest_commits() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let service = build_service(temp.path(), store.clone());

    let outcome = service
        .ingest(
            wav_upload(),
            CallerContext::user(7),
            None,
            Some((48.85, 2.35)),
            Some("device-a".to_string()),
        )
        .await
        .unwrap();

    let TimelineRef::Stored(timeline_id) = outcome.timeline_id else {
        panic!("expected a stored timeline");
    };
    let timeline = store.get_timeline(timeline_id).await.unwrap();
    assert_eq!(timeline.owner_id, Some(7));
    assert_eq!(timeline.device_id.as_deref(), Some("device-a"));
    assert_eq!(outcome.events[0].latitude, Some(48.85));
}

#[tokio::test]
async fn test_durable_append_checks_ownership() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let service = build_service(temp.path(), store.clone());

    let timeline = store
        .create_timeline(Some(7), None)
        .await
        .unwrap();

    let err = service
        .append(timeline.id, wav_upload(), CallerContext::user(8), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden));

    let err = service
        .append(timeline.id, wav_upload(), CallerContext::anonymous(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden));

    // The owner appends fine.
    let outcome = service
        .append(timeline.id, wav_upload(), CallerContext::user(7), None, None)
        .await
        .unwrap();
    assert_eq!(outcome.timeline_id, TimelineRef::Stored(timeline.id));
}

#[tokio::test]
async fn test_durable_append_unknown_timeline_is_not_found() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let service = build_service(temp.path(), store);

    let err = service
        .append(404, wav_upload(), CallerContext::user(7), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::TimelineNotFound));
}

#[tokio::test]
async fn test_oversized_upload_rejected_before_processing() {
    let temp = tempfile::TempDir::new().unwrap();
    let service = build_service(temp.path(), Arc::new(MemoryStore::new()));

    let upload = Upload {
        file_name: Some("huge.wav".to_string()),
        content_type: Some("audio/wav".to_string()),
        bytes: Bytes::from(vec![0u8; MAX_UPLOAD_BYTES + 1]),
    };
    let err = service
        .ingest(upload, CallerContext::anonymous(), None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    // Nothing landed in the uploads directory.
    let entries: Vec<_> = std::fs::read_dir(service.config().uploads_dir.clone())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .collect();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_octet_stream_upload_accepted() {
    let temp = tempfile::TempDir::new().unwrap();
    let service = build_service(temp.path(), Arc::new(MemoryStore::new()));

    let upload = Upload {
        file_name: Some("clip.m4a".to_string()),
        content_type: Some("application/octet-stream".to_string()),
        bytes: Bytes::from_static(b"ftypM4A "),
    };
    let outcome = service
        .ingest(upload, CallerContext::anonymous(), None, None, None)
        .await
        .unwrap();
    assert!(outcome.events[0].audio_file_path.ends_with(".m4a"));
}
