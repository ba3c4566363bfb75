//! Core ingestion logic: the transcription pipeline, the ingestion service
//! that drives it, and best-effort recovery of orphaned audio artifacts.

pub mod ingest;
pub mod pipeline;
pub mod recovery;

pub use ingest::{IngestOutcome, IngestionService, Upload};
pub use pipeline::{PipelineOutput, TranscriptionPipeline};
pub use recovery::RecoveryResolver;
