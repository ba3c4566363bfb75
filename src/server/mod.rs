//! HTTP boundary.
//!
//! Thin handlers over the ingestion service and stores; no business rules
//! live here beyond request decoding and status-code mapping. Caller
//! identity arrives as an `x-user-id` header asserted by the upstream
//! gateway that owns authentication.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::core::{IngestionService, RecoveryResolver, Upload};
use crate::core::ingest::{GenerateEvent, MAX_UPLOAD_BYTES};
use crate::domain::{CallerContext, Event, EventPatch, Timeline};
use crate::error::ServiceError;

/// Marker header set when playback fell back to a recovered artifact.
const RECOVERY_HEADER: &str = "x-echolog-recovery";

pub struct AppState {
    pub service: IngestionService,
    pub recovery: RecoveryResolver,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/audio/ingest", post(ingest_audio))
        .route("/api/audio/append/{timeline_id}", post(append_audio))
        .route("/api/audio/from-local", post(ingest_from_local))
        .route("/api/audio/{event_id}", get(serve_audio))
        .route("/api/events/{event_id}", get(get_event))
        .route("/api/timelines/generate", post(generate_timeline))
        .route("/api/timelines/{id}", get(get_timeline))
        .route("/api/timelines/{id}/export", get(export_timeline))
        .route("/api/timelines/{id}/events/{event_id}", put(update_event))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 1024 * 1024))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::TimelineNotFound | ServiceError::EventNotFound => {
                StatusCode::NOT_FOUND
            }
            ServiceError::Forbidden => StatusCode::FORBIDDEN,
            ServiceError::Persistence(_) | ServiceError::Internal(_) => {
                warn!(error = %self, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn caller_from(headers: &HeaderMap) -> CallerContext {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .map(CallerContext::user)
        .unwrap_or_else(CallerContext::anonymous)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Fields decoded from an ingestion multipart body.
#[derive(Default)]
struct IngestForm {
    upload: Option<Upload>,
    model: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    device_id: Option<String>,
}

impl IngestForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ServiceError> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ServiceError::Validation(format!("Malformed upload: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "audio" => {
                    let file_name = field.file_name().map(str::to_string);
                    let content_type = field.content_type().map(str::to_string);
                    let bytes = field.bytes().await.map_err(|e| {
                        ServiceError::Validation(format!("Failed to read upload: {e}"))
                    })?;
                    form.upload = Some(Upload {
                        file_name,
                        content_type,
                        bytes,
                    });
                }
                "model" => form.model = text_field(field).await?,
                "latitude" => form.latitude = float_field(field).await?,
                "longitude" => form.longitude = float_field(field).await?,
                "device_id" => form.device_id = text_field(field).await?,
                other => {
                    warn!(field = other, "Ignoring unknown form field");
                }
            }
        }
        Ok(form)
    }

    fn location(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    fn into_upload(mut self) -> Result<(Upload, Self), ServiceError> {
        match self.upload.take() {
            Some(upload) => Ok((upload, self)),
            None => Err(ServiceError::Validation(
                "No audio file provided".to_string(),
            )),
        }
    }
}

async fn text_field(
    field: axum::extract::multipart::Field<'_>,
) -> Result<Option<String>, ServiceError> {
    let text = field
        .text()
        .await
        .map_err(|e| ServiceError::Validation(format!("Malformed field: {e}")))?;
    let text = text.trim().to_string();
    Ok((!text.is_empty()).then_some(text))
}

async fn float_field(
    field: axum::extract::multipart::Field<'_>,
) -> Result<Option<f64>, ServiceError> {
    match text_field(field).await? {
        Some(text) => text
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ServiceError::Validation(format!("Invalid coordinate: {text}"))),
        None => Ok(None),
    }
}

async fn ingest_audio(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ServiceError> {
    let caller = caller_from(&headers);
    let (upload, form) = IngestForm::read(multipart).await?.into_upload()?;
    let outcome = state
        .service
        .ingest(
            upload,
            caller,
            form.model.as_deref(),
            form.location(),
            form.device_id.clone(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}

async fn append_audio(
    State(state): State<Arc<AppState>>,
    Path(timeline_id): Path<i64>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ServiceError> {
    let caller = caller_from(&headers);
    let (upload, form) = IngestForm::read(multipart).await?.into_upload()?;
    let outcome = state
        .service
        .append(timeline_id, upload, caller, form.model.as_deref(), form.location())
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}

#[derive(Deserialize)]
struct FromLocalRequest {
    #[serde(alias = "filePath")]
    path: String,
    model: Option<String>,
}

async fn ingest_from_local(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<FromLocalRequest>,
) -> Result<Response, ServiceError> {
    let caller = caller_from(&headers);
    let outcome = state
        .service
        .ingest_from_local(&req.path, caller, req.model.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}

#[derive(Deserialize)]
struct GenerateRequest {
    device_id: Option<String>,
    events: Vec<GenerateEvent>,
}

async fn generate_timeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, ServiceError> {
    let caller = caller_from(&headers);
    let outcome = state
        .service
        .generate(caller, req.device_id, req.events)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}

#[derive(Serialize)]
struct TimelineResponse {
    timeline: Timeline,
    events: Vec<Event>,
}

/// Load a timeline the caller is allowed to see. Ownership only applies on
/// the durable backend; the volatile store has no accounts.
async fn authorized_timeline(
    state: &AppState,
    id: i64,
    caller: CallerContext,
) -> Result<Timeline, ServiceError> {
    let store = state.service.store();
    let timeline = store.get_timeline(id).await?;
    if store.is_durable() && timeline.owner_id != caller.user_id {
        return Err(ServiceError::Forbidden);
    }
    Ok(timeline)
}

async fn get_timeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<TimelineResponse>, ServiceError> {
    let caller = caller_from(&headers);
    let timeline = authorized_timeline(&state, id, caller).await?;
    let events = state.service.store().get_events(id).await?;
    Ok(Json(TimelineResponse { timeline, events }))
}

async fn export_timeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let caller = caller_from(&headers);
    authorized_timeline(&state, id, caller).await?;
    let events = state.service.store().get_events(id).await?;

    let csv = export_csv(&events);
    let headers = [
        (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"timeline-{id}.csv\""),
        ),
    ];
    Ok((headers, csv).into_response())
}

async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Event>, ServiceError> {
    let caller = caller_from(&headers);
    let event = state.service.store().get_event(event_id).await?;
    authorized_timeline(&state, event.timeline_id, caller).await?;
    Ok(Json(event))
}

async fn update_event(
    State(state): State<Arc<AppState>>,
    Path((timeline_id, event_id)): Path<(i64, i64)>,
    headers: HeaderMap,
    Json(patch): Json<EventPatch>,
) -> Result<Json<Event>, ServiceError> {
    let caller = caller_from(&headers);
    authorized_timeline(&state, timeline_id, caller).await?;

    if patch.is_empty() {
        return Err(ServiceError::Validation(
            "No editable fields provided".to_string(),
        ));
    }

    let store = state.service.store();
    let current = store.get_event(event_id).await?;
    if current.timeline_id != timeline_id {
        return Err(ServiceError::EventNotFound);
    }

    Ok(Json(store.update_event(event_id, patch).await?))
}

async fn serve_audio(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
) -> Result<Response, ServiceError> {
    let store = state.service.store();

    let (path, recovered) = match store.get_event(event_id).await {
        Ok(event) => {
            let path = std::path::PathBuf::from(&event.audio_file_path);
            if path.is_file() {
                (path, false)
            } else {
                match state.recovery.resolve_orphaned_audio(event_id).await {
                    Some(found) => (found, true),
                    None => return Err(ServiceError::EventNotFound),
                }
            }
        }
        Err(_) => match state.recovery.resolve_orphaned_audio(event_id).await {
            Some(found) => (found, true),
            None => return Err(ServiceError::EventNotFound),
        },
    };

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ServiceError::EventNotFound)?;
    let len = file
        .metadata()
        .await
        .map(|m| m.len())
        .map_err(|e| ServiceError::Internal(e.into()))?;

    let stream = ReaderStream::new(file);
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(&path))
        .header(header::CONTENT_LENGTH, len)
        .header(header::ACCEPT_RANGES, "bytes");
    if recovered {
        response = response.header(RECOVERY_HEADER, "best-effort");
    }
    response
        .body(Body::from_stream(stream))
        .map_err(|e| ServiceError::Internal(e.into()))
}

/// Playback content type by artifact extension.
fn content_type_for(path: &FsPath) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("m4a") => "audio/mp4",
        _ => "audio/wav",
    }
}

/// Render a timeline's events as CSV, one row per event.
pub fn export_csv(events: &[Event]) -> String {
    let mut out = String::from("Event,Time,Transcript,Latitude,Longitude\n");
    for event in events {
        let lat = event.latitude.map(|v| v.to_string()).unwrap_or_default();
        let lon = event.longitude.map(|v| v.to_string()).unwrap_or_default();
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            event.event_number,
            csv_field(&event.time),
            csv_field(&event.transcript),
            lat,
            lon,
        ));
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains(['"', ',', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(number: i64, transcript: &str, lat: Option<f64>) -> Event {
        let now = Utc::now();
        Event {
            id: 1000 + number - 1,
            timeline_id: 1,
            event_number: number,
            time: "12:00".to_string(),
            transcript: transcript.to_string(),
            latitude: lat,
            longitude: lat.map(|v| -v),
            audio_file_path: "a.wav".to_string(),
            audio_duration_ms: 1000,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_export_csv_rows() {
        let events = vec![event(1, "hello", Some(51.5)), event(2, "world", None)];
        let csv = export_csv(&events);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Event,Time,Transcript,Latitude,Longitude");
        assert_eq!(lines[1], "1,12:00,hello,51.5,-51.5");
        assert_eq!(lines[2], "2,12:00,world,,");
    }

    #[test]
    fn test_export_csv_escapes_quotes_and_commas() {
        let events = vec![event(1, "she said \"hi\", twice", None)];
        let csv = export_csv(&events);
        assert!(csv.contains("\"she said \"\"hi\"\", twice\""));
    }

    #[test]
    fn test_content_type_map() {
        assert_eq!(content_type_for(FsPath::new("a.mp3")), "audio/mpeg");
        assert_eq!(content_type_for(FsPath::new("a.OGG")), "audio/ogg");
        assert_eq!(content_type_for(FsPath::new("a.m4a")), "audio/mp4");
        assert_eq!(content_type_for(FsPath::new("a.wav")), "audio/wav");
        assert_eq!(content_type_for(FsPath::new("a")), "audio/wav");
    }

    #[test]
    fn test_caller_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(!caller_from(&headers).is_authenticated());

        headers.insert("x-user-id", "7".parse().unwrap());
        assert_eq!(caller_from(&headers).user_id, Some(7));

        headers.insert("x-user-id", "not-a-number".parse().unwrap());
        assert!(!caller_from(&headers).is_authenticated());
    }
}
