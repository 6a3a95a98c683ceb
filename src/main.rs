mod chunker;
mod config;
mod embedding;
mod error;
mod ingest;
mod loader;
mod registry;
mod retriever;
mod server;
mod vector_index;

use anyhow::{Context, Result};
use config::Settings;
use ingest::Ingestor;
use registry::MetadataRegistry;
use retriever::Retriever;
use server::AppState;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vector_index::{DiskIndex, VectorIndex};

#[tokio::main]
async fn main() -> Result<()> {
    let settings_path = env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_SETTINGS_FILE.to_string());
    let settings = Settings::load(&settings_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(settings.log_filter())),
        )
        .init();

    if !Path::new(&settings_path).exists() {
        info!(path = %settings_path, "no settings file, using defaults");
    }

    let registry = Arc::new(MetadataRegistry::load(&settings.metadata_file_path).await);
    info!(
        path = %settings.metadata_file_path.display(),
        datasets = registry.len().await,
        "metadata registry loaded"
    );

    let embedder = embedding::from_settings(&settings)?;
    let index: Arc<dyn VectorIndex> = Arc::new(DiskIndex::new());
    info!(model = %embedder.model_name(), "embedding provider ready");

    let state = Arc::new(AppState {
        registry: registry.clone(),
        ingestor: Ingestor::new(registry.clone(), embedder.clone(), index.clone(), &settings.databases_dir),
        retriever: Retriever::new(registry, embedder, index),
    });
    let app = server::router(state, &settings.allowed_origin);

    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
