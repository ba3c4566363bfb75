//! Best-effort recovery of audio artifacts whose metadata is gone.
//!
//! The volatile store loses every timeline on restart, but artifacts remain
//! on disk. When playback is requested for an event no store knows about,
//! the resolver picks the most plausible surviving artifact instead of
//! returning nothing.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info};

use crate::store::memory::decode_event_id;

/// Audio extensions considered during a recovery scan.
const RECOVERABLE_EXTENSIONS: &[&str] = &["wav", "mp3", "ogg", "m4a"];

/// Scans the filtered-artifacts directory for orphaned audio.
pub struct RecoveryResolver {
    filtered_dir: PathBuf,
}

impl RecoveryResolver {
    pub fn new(filtered_dir: PathBuf) -> Self {
        Self { filtered_dir }
    }

    /// Find the best candidate artifact for an event id with no metadata:
    /// the newest audio file in the filtered directory. Returns `None` when
    /// the directory is empty or missing.
    pub async fn resolve_orphaned_audio(&self, event_id: i64) -> Option<PathBuf> {
        let (timeline_id, event_number) = decode_event_id(event_id);
        debug!(
            event_id,
            probable_timeline = timeline_id,
            probable_number = event_number,
            "Attempting artifact recovery"
        );

        let mut dir = match tokio::fs::read_dir(&self.filtered_dir).await {
            Ok(dir) => dir,
            Err(_) => return None,
        };

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if !is_recoverable_audio(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let Ok(mtime) = meta.modified() else {
                continue;
            };
            if newest.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
                newest = Some((mtime, path));
            }
        }

        match newest {
            Some((_, path)) => {
                info!(event_id, artifact = %path.display(), "Recovered orphaned artifact");
                Some(path)
            }
            None => {
                debug!(event_id, "No recoverable artifact found");
                None
            }
        }
    }
}

fn is_recoverable_audio(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| RECOVERABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
