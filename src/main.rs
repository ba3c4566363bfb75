//! echolog server entrypoint

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use echolog::adapters::ToolInvoker;
use echolog::core::{IngestionService, RecoveryResolver, TranscriptionPipeline};
use echolog::server::{serve, AppState};
use echolog::store::{MemoryStore, SqliteStore, TimelineStore};
use echolog::Config;

#[derive(Parser, Debug)]
#[command(name = "echolog", about = "Audio ingestion and timeline assembly server")]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "ECHOLOG_PORT", default_value_t = 5000)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let config = Config::from_env()?;
    config.ensure_dirs()?;

    let store: Arc<dyn TimelineStore> = match config.db_path {
        Some(ref path) => {
            info!(db = %path.display(), "Using durable SQLite store");
            Arc::new(SqliteStore::open(path)?)
        }
        None => {
            info!("Using volatile in-memory store; timelines will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let invoker = Arc::new(ToolInvoker::new(
        config.scripts_dir.clone(),
        config.filtered_dir.clone(),
        config.tool_timeout,
        config.python_override.clone(),
    ));
    let pipeline = TranscriptionPipeline::new(invoker, config.whisper_model.clone());
    let recovery = RecoveryResolver::new(config.filtered_dir.clone());
    let service = IngestionService::new(config, pipeline, store);

    serve(Arc::new(AppState { service, recovery }), cli.port).await
}
