//! External tool invocation: audio filtering and speech-to-text.
//!
//! Both capabilities are Python scripts executed as subprocesses. Filtering
//! is best-effort (failure degrades to passthrough); transcription degrades
//! to a single placeholder segment. Neither ever raises past this layer once
//! the input path is known.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::domain::Segment;

/// Transcript text when the transcription tool produced nothing usable.
pub const PLACEHOLDER_UNAVAILABLE: &str = "Transcription unavailable.";

/// Transcript text when the transcription script is not installed.
pub const PLACEHOLDER_SCRIPT_MISSING: &str = "Transcription script not found.";

/// Interpreter candidates probed in order when no override is set.
const PYTHON_CANDIDATES: &[&str] = &["python3", "python", "py -3"];

/// Budget for the trivial probe invocation.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed filter tuning: cutoff frequency (Hz), order, filter type.
const FILTER_ARGS: &[&str] = &["400", "3", "lowpass"];

/// Structured output of the transcription capability.
#[derive(Debug, Clone)]
pub struct TranscribeOutput {
    pub segments: Vec<Segment>,
    pub text: String,
    pub language: String,
}

impl TranscribeOutput {
    fn placeholder(reason: &str) -> Self {
        Self {
            segments: vec![Segment::placeholder(reason)],
            text: String::new(),
            language: String::new(),
        }
    }
}

/// Transcription tool JSON structure (stdout of transcribe_audio.py).
#[derive(Debug, Deserialize)]
struct RawTranscription {
    #[serde(default)]
    text: String,

    #[serde(default)]
    language: String,

    #[serde(default)]
    segments: Vec<Segment>,

    #[serde(default)]
    error: Option<String>,
}

/// Wraps invocation of the filter and transcribe tools.
///
/// The interpreter is resolved once per process on first use; failure to
/// resolve is not fatal, it just means every transcription degrades to a
/// placeholder until an interpreter appears on a restart.
pub struct ToolInvoker {
    scripts_dir: PathBuf,
    filtered_dir: PathBuf,
    tool_timeout: Duration,
    python_override: Option<String>,
    python: OnceCell<Option<String>>,
}

impl ToolInvoker {
    pub fn new(
        scripts_dir: PathBuf,
        filtered_dir: PathBuf,
        tool_timeout: Duration,
        python_override: Option<String>,
    ) -> Self {
        Self {
            scripts_dir,
            filtered_dir,
            tool_timeout,
            python_override,
            python: OnceCell::new(),
        }
    }

    /// Build a command from a possibly multi-token interpreter string
    /// (e.g. "py -3").
    fn command_for(cmd: &str) -> Command {
        let mut parts = cmd.split_whitespace();
        let mut command = Command::new(parts.next().unwrap_or(cmd));
        command.args(parts);
        command
    }

    /// Resolve the interpreter command: the override if set, else the first
    /// candidate that survives a trivial invocation. Cached for the process.
    async fn python_command(&self) -> Option<&str> {
        self.python
            .get_or_init(|| async {
                if let Some(ref cmd) = self.python_override {
                    return Some(cmd.clone());
                }
                for candidate in PYTHON_CANDIDATES {
                    let mut probe = Self::command_for(candidate);
                    probe
                        .args(["-c", "import sys"])
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .kill_on_drop(true);
                    match timeout(PROBE_TIMEOUT, probe.output()).await {
                        Ok(Ok(output)) if output.status.success() => {
                            info!(interpreter = candidate, "Resolved interpreter");
                            return Some(candidate.to_string());
                        }
                        _ => continue,
                    }
                }
                warn!("No usable interpreter found; transcription will degrade");
                None
            })
            .await
            .as_deref()
    }

    /// Apply the noise filter to `input`, producing a new artifact in the
    /// filtered directory. On any failure the original path is returned
    /// unchanged; filtering never blocks ingestion.
    pub async fn run_filter(&self, input: &Path) -> PathBuf {
        let script = self.scripts_dir.join("filter_audio.py");
        if !script.is_file() {
            debug!("Filter script not present, passing audio through");
            return input.to_path_buf();
        }

        let python = match self.python_command().await {
            Some(cmd) => cmd,
            None => {
                warn!("Filtering skipped: no interpreter available");
                return input.to_path_buf();
            }
        };

        let output_path = self.filtered_dir.join(format!(
            "filtered-{}.wav",
            chrono::Utc::now().timestamp_millis()
        ));

        let result = timeout(
            self.tool_timeout,
            Self::command_for(python)
                .arg(&script)
                .arg(input)
                .arg(&output_path)
                .args(FILTER_ARGS)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(out)) if out.status.success() && output_path.is_file() => {
                debug!(output = %output_path.display(), "Filter produced artifact");
                output_path
            }
            Ok(Ok(out)) => {
                warn!(
                    exit = out.status.code().unwrap_or(-1),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "Filtering skipped"
                );
                Self::discard_partial(&output_path).await;
                input.to_path_buf()
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Filtering skipped");
                input.to_path_buf()
            }
            Err(_) => {
                warn!(budget = ?self.tool_timeout, "Filter timed out, passing audio through");
                Self::discard_partial(&output_path).await;
                input.to_path_buf()
            }
        }
    }

    /// Remove the output of a failed or killed filter run so partial files
    /// never surface as playback or recovery candidates.
    async fn discard_partial(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove partial artifact");
            }
        }
    }

    /// Transcribe `input` with the given model. Captures JSON from stdout and
    /// persists a copy next to the audio artifact. All failure modes degrade
    /// to a single placeholder segment.
    pub async fn run_transcribe(&self, input: &Path, model: &str) -> TranscribeOutput {
        let script = self.scripts_dir.join("transcribe_audio.py");
        if !script.is_file() {
            warn!("Transcription script not present");
            return TranscribeOutput::placeholder(PLACEHOLDER_SCRIPT_MISSING);
        }

        let python = match self.python_command().await {
            Some(cmd) => cmd,
            None => {
                warn!("Transcription unavailable: no interpreter");
                return TranscribeOutput::placeholder(PLACEHOLDER_UNAVAILABLE);
            }
        };

        let sidecar = input.with_extension("transcription.json");

        let result = timeout(
            self.tool_timeout,
            Self::command_for(python)
                .arg(&script)
                .arg(input)
                .args(["--model", model])
                .arg("--output_json")
                .arg(&sidecar)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match result {
            Ok(Ok(out)) if out.status.success() => out,
            Ok(Ok(out)) => {
                warn!(
                    exit = out.status.code().unwrap_or(-1),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    input = %input.display(),
                    "Transcription failed"
                );
                return TranscribeOutput::placeholder(PLACEHOLDER_UNAVAILABLE);
            }
            Ok(Err(e)) => {
                warn!(error = %e, input = %input.display(), "Transcription failed");
                return TranscribeOutput::placeholder(PLACEHOLDER_UNAVAILABLE);
            }
            Err(_) => {
                warn!(
                    budget = ?self.tool_timeout,
                    input = %input.display(),
                    "Transcription timed out"
                );
                return TranscribeOutput::placeholder(PLACEHOLDER_UNAVAILABLE);
            }
        };

        let raw = String::from_utf8_lossy(&output.stdout);
        let raw = raw.trim();

        // Keep a copy of the tool output next to the artifact for offline
        // diagnosis, whether or not the script wrote its own.
        if !raw.is_empty() {
            if let Err(e) = tokio::fs::write(&sidecar, raw).await {
                warn!(error = %e, path = %sidecar.display(), "Failed to persist transcription sidecar");
            }
        }

        let parsed: RawTranscription = match serde_json::from_str(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    error = %e,
                    head = %raw.chars().take(200).collect::<String>(),
                    "Transcription output not JSON"
                );
                return TranscribeOutput::placeholder(PLACEHOLDER_UNAVAILABLE);
            }
        };

        if let Some(ref err) = parsed.error {
            warn!(error = %err, "Transcription tool reported an error");
        }

        let mut segments = parsed.segments;
        if segments.is_empty() && !parsed.text.trim().is_empty() {
            segments.push(Segment {
                start: 0.0,
                end: 0.0,
                text: parsed.text.clone(),
            });
        }
        if segments.is_empty() {
            segments.push(Segment::placeholder(PLACEHOLDER_UNAVAILABLE));
        }

        TranscribeOutput {
            segments,
            text: parsed.text,
            language: parsed.language,
        }
    }
}
