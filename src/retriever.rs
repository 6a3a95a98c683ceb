use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::embedding::Embedder;
use crate::error::ServiceError;
use crate::registry::MetadataRegistry;
use crate::vector_index::{SearchHit, StoreError, VectorIndex};

pub const DEFAULT_TOP_K: usize = 5;

const QUERY_FAILED: &str = "An error occurred while querying the database.";

pub struct Retriever {
    registry: Arc<MetadataRegistry>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl Retriever {
    pub fn new(registry: Arc<MetadataRegistry>, embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Retriever {
            registry,
            embedder,
            index,
        }
    }

    /// Runs `retrieve` and renders the hits for the assistant.
    pub async fn query(&self, dataset_name: &str, query: &str, top_k: usize) -> Result<String, ServiceError> {
        let hits = self.retrieve(dataset_name, query, top_k).await?;
        Ok(format_results(query, dataset_name, &hits))
    }

    pub async fn retrieve(&self, dataset_name: &str, query: &str, top_k: usize) -> Result<Vec<SearchHit>, ServiceError> {
        if query.is_empty() || dataset_name.is_empty() {
            warn!("Both 'query' and 'dataset_name' are required.");
            return Err(ServiceError::Precondition(
                "Both 'query' and 'dataset_name' are required.".to_string(),
            ));
        }

        let Some(record) = self.registry.get(dataset_name).await else {
            warn!(dataset = %dataset_name, "No database found");
            return Err(ServiceError::NotFound(format!("No database found for {dataset_name}")));
        };
        let Some(db_path) = record.field("db_path") else {
            warn!(dataset = %dataset_name, "No db_path found");
            return Err(ServiceError::NotFound(format!("No db_path found for {dataset_name}")));
        };

        let query_vector = self.embedder.embed(query).await.map_err(|e| {
            error!(dataset = %dataset_name, error = %e, "Error embedding query");
            ServiceError::Retrieval(QUERY_FAILED.to_string())
        })?;

        let hits = self
            .index
            .search(Path::new(db_path), &query_vector, top_k)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => {
                    warn!(dataset = %dataset_name, path = %db_path, "registered index is missing on disk");
                    ServiceError::NotFound(format!("No database found for {dataset_name}"))
                }
                e => {
                    error!(dataset = %dataset_name, path = %db_path, error = %e, "Error querying the database");
                    ServiceError::Retrieval(QUERY_FAILED.to_string())
                }
            })?;

        debug!(
            dataset = %dataset_name,
            hits = hits.len(),
            top_score = hits.first().map_or(0.0, |h| h.score),
            "query served"
        );
        Ok(hits)
    }
}

/// Numbered segment blocks behind a header that asks the consumer to merge
/// every segment into a single answer.
pub fn format_results(query: &str, dataset_name: &str, hits: &[SearchHit]) -> String {
    let mut out = format!(
        "Based on your query '{query}', we've identified the following relevant sections from \
         {dataset_name}. Please review them to gather the necessary information from all \
         segments and summarize all to one before submitting it to user\n"
    );

    for (idx, hit) in hits.iter().enumerate() {
        let segment = &hit.segment;
        let _ = write!(out, "\n---\nSegment {}:\n{}\nSource: {}", idx + 1, segment.content, segment.source_path);
        if let Some(section) = &segment.section {
            let _ = write!(out, " ({section})");
        }
        out.push_str("\n---\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::ingest::tests::{FailingEmbedder, Fixture};
    use crate::registry::DatasetRecord;
    use anyhow::Result;

    fn retriever(fx: &Fixture, embedder: Arc<dyn Embedder>) -> Retriever {
        Retriever::new(fx.registry.clone(), embedder, fx.index.clone())
    }

    #[tokio::test]
    async fn test_ingest_then_query() -> Result<()> {
        let fx = Fixture::new().await?;
        let folder = fx.folder("docs", &[("a.txt", "hello world"), ("b.pdf", "%PDF-broken")])?;
        fx.ingestor(Arc::new(HashEmbedder)).ingest(&folder, "docs_v1").await.unwrap();

        let out = retriever(&fx, Arc::new(HashEmbedder))
            .query("docs_v1", "hello", DEFAULT_TOP_K)
            .await
            .unwrap();
        assert!(out.contains("Segment 1"));
        assert!(out.contains("hello world"));
        assert!(!out.contains("Segment 2"));
        assert!(out.contains("summarize all to one"));
        Ok(())
    }

    #[tokio::test]
    async fn test_results_trace_back_to_source_folder() -> Result<()> {
        let fx = Fixture::new().await?;
        let long = "rust ownership borrowing lifetimes ".repeat(80);
        let folder = fx.folder(
            "docs",
            &[("a.txt", long.as_str()), ("b.txt", "tokio runtime tasks"), ("c.csv", "k,v\n1,2\n")],
        )?;
        fx.ingestor(Arc::new(HashEmbedder)).ingest(&folder, "docs").await.unwrap();

        let hits = retriever(&fx, Arc::new(HashEmbedder)).retrieve("docs", "borrowing", 100).await.unwrap();
        assert!(hits.len() > 3);
        assert!(hits.iter().all(|h| h.segment.source_path.starts_with(&folder)));
        assert!(hits[0].segment.source_path.ends_with("a.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn test_reingest_replaces_content() -> Result<()> {
        let fx = Fixture::new().await?;
        let old = fx.folder("old", &[("old.txt", "apples and pears")])?;
        let new = fx.folder("new", &[("new.txt", "bananas and cherries")])?;
        let ingestor = fx.ingestor(Arc::new(HashEmbedder));
        ingestor.ingest(&old, "fruit").await.unwrap();
        ingestor.ingest(&new, "fruit").await.unwrap();

        assert_eq!(fx.registry.get("fruit").await.unwrap().source_folder, new);
        let hits = retriever(&fx, Arc::new(HashEmbedder)).retrieve("fruit", "apples", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].segment.source_path.ends_with("new.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_dataset_is_not_found() -> Result<()> {
        let fx = Fixture::new().await?;
        // A failing embedder proves the lookup fails before any provider call.
        let err = retriever(&fx, Arc::new(FailingEmbedder))
            .query("nonexistent", "anything", DEFAULT_TOP_K)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(err.to_string().contains("nonexistent"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_fields_are_preconditions() -> Result<()> {
        let fx = Fixture::new().await?;
        let r = retriever(&fx, Arc::new(HashEmbedder));
        assert!(matches!(r.query("", "q", 5).await, Err(ServiceError::Precondition(_))));
        assert!(matches!(r.query("docs", "", 5).await, Err(ServiceError::Precondition(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_record_without_db_path_is_not_found() -> Result<()> {
        let fx = Fixture::new().await?;
        fx.registry
            .put(
                "half",
                DatasetRecord {
                    index_location: String::new(),
                    source_folder: "/somewhere".to_string(),
                },
            )
            .await?;

        let err = retriever(&fx, Arc::new(HashEmbedder)).query("half", "q", 5).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(ref m) if m == "No db_path found for half"));
        Ok(())
    }

    #[tokio::test]
    async fn test_index_missing_on_disk_is_not_found() -> Result<()> {
        let fx = Fixture::new().await?;
        fx.registry
            .put(
                "ghost",
                DatasetRecord {
                    index_location: fx.dir.path().join("databases/ghost").to_string_lossy().to_string(),
                    source_folder: "/somewhere".to_string(),
                },
            )
            .await?;

        let err = retriever(&fx, Arc::new(HashEmbedder)).query("ghost", "q", 5).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_embedding_failure_is_generic() -> Result<()> {
        let fx = Fixture::new().await?;
        let folder = fx.folder("docs", &[("a.txt", "hello")])?;
        fx.ingestor(Arc::new(HashEmbedder)).ingest(&folder, "docs").await.unwrap();

        let err = retriever(&fx, Arc::new(FailingEmbedder)).query("docs", "hello", 5).await.unwrap_err();
        assert!(matches!(err, ServiceError::Retrieval(_)));
        assert_eq!(err.to_string(), QUERY_FAILED);
        assert!(!err.to_string().contains("quota"));
        Ok(())
    }

    #[test]
    fn test_format_numbers_segments() {
        use crate::chunker::TextSegment;
        let hits = vec![
            SearchHit {
                segment: TextSegment {
                    content: "first".to_string(),
                    source_path: "/d/a.pdf".to_string(),
                    section: Some("page 2".to_string()),
                },
                score: 0.9,
            },
            SearchHit {
                segment: TextSegment {
                    content: "second".to_string(),
                    source_path: "/d/b.txt".to_string(),
                    section: None,
                },
                score: 0.5,
            },
        ];
        let out = format_results("q", "ds", &hits);
        assert!(out.starts_with("Based on your query 'q'"));
        assert!(out.contains("\n---\nSegment 1:\nfirst\nSource: /d/a.pdf (page 2)\n---\n"));
        assert!(out.contains("\n---\nSegment 2:\nsecond\nSource: /d/b.txt\n---\n"));
    }
}
