use rustc_hash::FxHashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::chunker::{self, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::embedding::Embedder;
use crate::error::ServiceError;
use crate::loader;
use crate::registry::{DatasetRecord, MetadataRegistry};
use crate::vector_index::VectorIndex;

#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub dataset: String,
    pub index_location: PathBuf,
    pub files_loaded: usize,
    pub files_failed: usize,
    pub segments: usize,
}

/// Builds a dataset: load -> chunk -> embed -> index -> register.
pub struct Ingestor {
    registry: Arc<MetadataRegistry>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    databases_dir: PathBuf,
    // One lock per dataset name so a re-ingest cannot interleave its index
    // write and registry write with another run for the same name.
    in_flight: Mutex<FxHashMap<String, Arc<Mutex<()>>>>,
}

impl Ingestor {
    pub fn new(
        registry: Arc<MetadataRegistry>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        databases_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            embedder,
            index,
            databases_dir: databases_dir.into(),
            in_flight: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn index_location(&self, dataset_name: &str) -> PathBuf {
        self.databases_dir.join(dataset_name)
    }

    pub async fn ingest(&self, folder_path: &str, dataset_name: &str) -> Result<IngestSummary, ServiceError> {
        if folder_path.is_empty() || dataset_name.is_empty() {
            return Err(ServiceError::Precondition(
                "folder_path and dataset_name are required.".to_string(),
            ));
        }
        if !is_plain_name(dataset_name) {
            return Err(ServiceError::Precondition(format!(
                "dataset_name {dataset_name} must be a plain name without path separators."
            )));
        }
        if !Path::new(folder_path).is_dir() {
            return Err(ServiceError::Precondition(format!(
                "The provided folder path {folder_path} does not exist."
            )));
        }

        let lock = self.lock_for(dataset_name).await;
        let result = {
            let _held = lock.lock().await;
            self.build(folder_path, dataset_name).await
        };
        self.release(dataset_name, lock).await;
        result
    }

    async fn build(&self, folder_path: &str, dataset_name: &str) -> Result<IngestSummary, ServiceError> {
        info!(dataset = %dataset_name, folder = %folder_path, "Loading documents");
        let folder = PathBuf::from(folder_path);
        let report = tokio::task::spawn_blocking(move || loader::load_directory(folder))
            .await
            .map_err(|e| {
                error!(dataset = %dataset_name, error = %e, "loader task failed");
                ServiceError::Ingestion(format!("Error loading documents: {e}"))
            })?
            .map_err(|e| {
                error!(dataset = %dataset_name, error = %e, "Error loading documents");
                ServiceError::Ingestion(format!("Error loading documents: {e}"))
            })?;

        for failure in &report.failures {
            warn!(dataset = %dataset_name, path = %failure.path.display(), reason = %failure.reason, "file skipped");
        }

        let fail = |message: String| {
            error!(dataset = %dataset_name, folder = %folder_path, "{message}");
            ServiceError::Ingestion(message)
        };

        let segments = chunker::split(&report.records, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
            .map_err(|e| fail(format!("Error creating vector database: {e}")))?;
        if segments.is_empty() {
            return Err(fail(format!(
                "Error creating vector database: no text could be extracted from {folder_path}"
            )));
        }

        let texts: Vec<String> = segments.iter().map(|s| s.content.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| fail(format!("Error creating vector database: {e}")))?;

        let index_location = self.index_location(dataset_name);
        let segment_count = segments.len();
        self.index
            .create(&index_location, segments, vectors)
            .await
            .map_err(|e| fail(format!("Error creating vector database: {e}")))?;

        let record = DatasetRecord {
            index_location: index_location.to_string_lossy().to_string(),
            source_folder: folder_path.to_string(),
        };
        if let Err(e) = self.registry.put(dataset_name, record).await {
            warn!(
                dataset = %dataset_name,
                location = %index_location.display(),
                "index written but not registered; it is orphaned until the next ingest"
            );
            return Err(fail(format!("Error creating vector database: {e}")));
        }

        info!(
            dataset = %dataset_name,
            files = report.files_loaded,
            skipped = report.failures.len(),
            segments = segment_count,
            model = %self.embedder.model_name(),
            "dataset created"
        );

        Ok(IngestSummary {
            dataset: dataset_name.to_string(),
            index_location,
            files_loaded: report.files_loaded,
            files_failed: report.failures.len(),
            segments: segment_count,
        })
    }

    async fn lock_for(&self, dataset_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.in_flight.lock().await;
        locks.entry(dataset_name.to_string()).or_default().clone()
    }

    /// Drops the name's lock entry once no other run holds or awaits it.
    async fn release(&self, dataset_name: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.in_flight.lock().await;
        // One reference in the map plus ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(dataset_name);
        }
    }
}

/// Exactly one normal path component, so the index stays under `databases_dir`.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}
