//! Configuration for echolog paths and tool budgets.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ECHOLOG_*, WHISPER_MODEL, LOCAL_AUDIO_BASE)
//! 2. Defaults (~/.echolog)
//!
//! The config is constructed once at process start and passed by reference
//! to every component; there is no global accessor.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Default per-invocation budget for the external filter/transcribe tools.
/// CPU-only transcription of long recordings can take minutes.
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 600;

/// Resolved configuration with absolute paths.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base data directory (ECHOLOG_DATA_DIR or ~/.echolog).
    pub data_dir: PathBuf,

    /// Where uploaded recordings are written.
    pub uploads_dir: PathBuf,

    /// Where filtered artifacts (and transcription sidecars) are written.
    pub filtered_dir: PathBuf,

    /// Base directory local-path ingestion is confined to
    /// (LOCAL_AUDIO_BASE, defaults to the uploads dir).
    pub local_audio_base: PathBuf,

    /// Directory holding filter_audio.py / transcribe_audio.py
    /// (ECHOLOG_SCRIPTS_DIR, defaults to ./scripts).
    pub scripts_dir: PathBuf,

    /// SQLite database path. When set, the durable backend is active for the
    /// whole process lifetime; otherwise the volatile in-memory store is used.
    pub db_path: Option<PathBuf>,

    /// Explicit interpreter command (ECHOLOG_PYTHON); bypasses probing.
    pub python_override: Option<String>,

    /// Default Whisper model name (WHISPER_MODEL or "base").
    pub whisper_model: String,

    /// Timeout budget per external tool invocation.
    pub tool_timeout: Duration,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let data_dir = match std::env::var("ECHOLOG_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::home_dir()
                .context("Failed to determine home directory")?
                .join(".echolog"),
        };

        let uploads_dir = data_dir.join("uploads");
        let filtered_dir = uploads_dir.join("filtered");

        let local_audio_base = std::env::var("LOCAL_AUDIO_BASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| uploads_dir.clone());

        let scripts_dir = std::env::var("ECHOLOG_SCRIPTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("scripts"));

        let db_path = std::env::var("ECHOLOG_DB").ok().map(PathBuf::from);

        let python_override = std::env::var("ECHOLOG_PYTHON")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let whisper_model =
            std::env::var("WHISPER_MODEL").unwrap_or_else(|_| "base".to_string());

        let tool_timeout_secs = std::env::var("ECHOLOG_TOOL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS);

        Ok(Self {
            data_dir,
            uploads_dir,
            filtered_dir,
            local_audio_base,
            scripts_dir,
            db_path,
            python_override,
            whisper_model,
            tool_timeout: Duration::from_secs(tool_timeout_secs),
        })
    }

    /// Create the artifact directories if they do not exist yet.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.filtered_dir).with_context(|| {
            format!(
                "Failed to create artifacts directory: {}",
                self.filtered_dir.display()
            )
        })?;
        Ok(())
    }

    /// Whether the durable backend is configured for this process.
    pub fn durable(&self) -> bool {
        self.db_path.is_some()
    }
}
