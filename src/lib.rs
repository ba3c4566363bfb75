//! echolog: audio ingestion and timeline assembly.
//!
//! Recordings arrive over HTTP, pass through an external filter/transcribe
//! tool pair, and are committed as ordered events on timelines held in either
//! a volatile in-memory store or a durable SQLite store.

pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod server;
pub mod store;

pub use config::Config;
pub use crate::core::{
    IngestOutcome, IngestionService, RecoveryResolver, TranscriptionPipeline, Upload,
};
pub use domain::{CallerContext, Event, Segment, Timeline, TimelineRef};
pub use error::{Result, ServiceError};
pub use store::{MemoryStore, SqliteStore, TimelineStore};
