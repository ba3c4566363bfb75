//! Filter-then-transcribe pipeline over a stored audio artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use tracing::{debug, instrument};

use crate::adapters::ToolInvoker;
use crate::domain::Segment;

/// Result of running one recording through the pipeline. Always produced:
/// tool failures degrade to a placeholder transcript, never to an error.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub segments: Vec<Segment>,

    /// Full transcript text, assembled from segments when the tool did not
    /// provide one directly.
    pub full_text: String,

    /// Detected language, empty when unknown.
    pub language: String,

    /// Artifact actually transcribed: the filtered copy when filtering
    /// succeeded, the original otherwise.
    pub filtered_audio_path: PathBuf,

    /// Recording duration derived from the last segment end, in ms. Zero for
    /// placeholder output.
    pub audio_duration_ms: i64,
}

/// Runs the fixed two-stage pipeline: noise filter, then speech-to-text.
pub struct TranscriptionPipeline {
    invoker: Arc<ToolInvoker>,
    default_model: String,
}

impl TranscriptionPipeline {
    pub fn new(invoker: Arc<ToolInvoker>, default_model: String) -> Self {
        Self {
            invoker,
            default_model,
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Process one stored artifact. `model` overrides the configured default
    /// for this invocation only.
    #[instrument(skip(self), fields(input = %input.display()))]
    pub async fn process(&self, input: &Path, model: Option<&str>) -> PipelineOutput {
        let filtered = self.invoker.run_filter(input).await;

        let model = model.unwrap_or(&self.default_model);
        let transcription = self.invoker.run_transcribe(&filtered, model).await;

        let full_text = if transcription.text.trim().is_empty() {
            join_segments(&transcription.segments)
        } else {
            transcription.text.clone()
        };
        let audio_duration_ms = duration_ms(&transcription.segments);

        debug!(
            segments = transcription.segments.len(),
            duration_ms = audio_duration_ms,
            "Pipeline finished"
        );

        PipelineOutput {
            segments: transcription.segments,
            full_text,
            language: transcription.language,
            filtered_audio_path: filtered,
            audio_duration_ms,
        }
    }
}

fn join_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn duration_ms(segments: &[Segment]) -> i64 {
    let end = segments.iter().fold(0.0f64, |acc, s| acc.max(s.end));
    (end * 1000.0).round() as i64
}

/// Wall-clock start of the recording: the artifact's modification time when
/// the filesystem provides one, otherwise now.
pub async fn recording_start_time(artifact: &Path) -> DateTime<Utc> {
    match tokio::fs::metadata(artifact).await.and_then(|m| m.modified()) {
        Ok(mtime) => DateTime::<Utc>::from(mtime),
        Err(_) => Utc::now(),
    }
}

/// Local-time "HH:MM" label for an event.
pub fn recorded_time_label(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64, text: &str) -> Segment {
        Segment {
            start,
            end,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_join_segments_trims_and_skips_empty() {
        let segments = vec![seg(0.0, 1.0, "  hello "), seg(1.0, 2.0, "  "), seg(2.0, 3.0, "world")];
        assert_eq!(join_segments(&segments), "hello world");
    }

    #[test]
    fn test_duration_from_last_segment_end() {
        let segments = vec![seg(0.0, 1.5, "a"), seg(1.5, 4.25, "b")];
        assert_eq!(duration_ms(&segments), 4250);

        // Placeholder output carries zero duration.
        let placeholder = vec![Segment::placeholder("Transcription unavailable.")];
        assert_eq!(duration_ms(&placeholder), 0);
    }

    #[test]
    fn test_time_label_format() {
        let label = recorded_time_label(Utc::now());
        assert_eq!(label.len(), 5);
        assert_eq!(label.as_bytes()[2], b':');
    }

    #[tokio::test]
    async fn test_recording_start_prefers_mtime() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("clip.wav");
        tokio::fs::write(&path, b"RIFF").await.unwrap();

        let backdated = filetime::FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&path, backdated).unwrap();

        let start = recording_start_time(&path).await;
        assert_eq!(start.timestamp(), 1_600_000_000);
    }

    #[tokio::test]
    async fn test_recording_start_missing_file_is_now() {
        let before = Utc::now();
        let start = recording_start_time(Path::new("/nonexistent/clip.wav")).await;
        assert!(start >= before);
    }
}
