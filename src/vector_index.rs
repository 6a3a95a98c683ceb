use async_trait::async_trait;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::chunker::TextSegment;
use crate::embedding::Embedding;

const INDEX_FILE: &str = "index.json";
const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no index found at {0}")]
    NotFound(String),
    #[error("index io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("index at {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },
    #[error("query vector has dimension {got}, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("vector {index} has a non-finite component")]
    NonFinite { index: usize },
    #[error("{segments} segments but {vectors} vectors")]
    LengthMismatch { segments: usize, vectors: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub segment: TextSegment,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Creates the index at `location`, replacing whatever was there.
    async fn create(
        &self,
        location: &Path,
        segments: Vec<TextSegment>,
        vectors: Vec<Embedding>,
    ) -> Result<(), StoreError>;

    /// Up to `k` segments, most similar first. Equal scores keep insertion order.
    async fn search(&self, location: &Path, query: &[f32], k: usize) -> Result<Vec<SearchHit>, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    dimension: usize,
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    id: Uuid,
    #[serde(flatten)]
    segment: TextSegment,
    embedding: Embedding,
}

/// Exhaustive cosine search over a JSON file per dataset.
#[derive(Debug, Default)]
pub struct DiskIndex;

impl DiskIndex {
    pub fn new() -> Self {
        DiskIndex
    }

    fn io_err(path: &Path) -> impl Fn(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl VectorIndex for DiskIndex {
    async fn create(
        &self,
        location: &Path,
        segments: Vec<TextSegment>,
        vectors: Vec<Embedding>,
    ) -> Result<(), StoreError> {
        if segments.len() != vectors.len() {
            return Err(StoreError::LengthMismatch {
                segments: segments.len(),
                vectors: vectors.len(),
            });
        }

        let dimension = vectors.first().map_or(0, Vec::len);
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(StoreError::DimensionMismatch {
                expected: dimension,
                got: bad.len(),
            });
        }

        // JSON cannot carry NaN or infinity, so such an index could never be read back.
        if let Some(index) = vectors.iter().position(|v| v.iter().any(|x| !x.is_finite())) {
            return Err(StoreError::NonFinite { index });
        }

        let file = IndexFile {
            version: INDEX_FORMAT_VERSION,
            dimension,
            entries: segments
                .into_iter()
                .zip(vectors)
                .map(|(segment, embedding)| IndexEntry {
                    id: Uuid::new_v4(),
                    segment,
                    embedding,
                })
                .collect(),
        };
        let body = serde_json::to_vec(&file).map_err(|e| StoreError::Corrupt {
            path: location.display().to_string(),
            message: e.to_string(),
        })?;

        tokio::fs::create_dir_all(location)
            .await
            .map_err(Self::io_err(location))?;
        let target = location.join(INDEX_FILE);
        let tmp = location.join(format!("{INDEX_FILE}.tmp"));
        tokio::fs::write(&tmp, body).await.map_err(Self::io_err(&tmp))?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Self::io_err(&target)(e));
        }

        debug!(location = %location.display(), entries = file.entries.len(), "index written");
        Ok(())
    }

    async fn search(&self, location: &Path, query: &[f32], k: usize) -> Result<Vec<SearchHit>, StoreError> {
        let path: PathBuf = location.join(INDEX_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(location.display().to_string()));
            }
            Err(e) => return Err(Self::io_err(&path)(e)),
        };
        let file: IndexFile = serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        if !file.entries.is_empty() && query.len() != file.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: file.dimension,
                got: query.len(),
            });
        }

        let query = ArrayView1::from(query);
        let mut scored: Vec<(f32, IndexEntry)> = file
            .entries
            .into_iter()
            .map(|entry| (cosine_similarity(query, ArrayView1::from(&entry.embedding[..])), entry))
            .collect();

        // sort_by is stable, so ties stay in insertion order.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, entry)| SearchHit {
                segment: entry.segment,
                score,
            })
            .collect())
    }
}

fn cosine_similarity(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let dot_product = a.dot(&b);
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}
