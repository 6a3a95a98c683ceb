use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to persist registry to {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One registered dataset, as stored in the registry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    #[serde(rename = "db_path", default)]
    pub index_location: String,
    #[serde(rename = "folder_path", default)]
    pub source_folder: String,
}

impl DatasetRecord {
    /// Looks up a field by its registry-file key (`db_path` or `folder_path`).
    /// Empty values count as absent.
    pub fn field(&self, key: &str) -> Option<&str> {
        let value = match key {
            "db_path" => &self.index_location,
            "folder_path" => &self.source_folder,
            _ => return None,
        };
        (!value.is_empty()).then_some(value.as_str())
    }
}

/// Dataset name -> record, mirrored to a single JSON file.
pub struct MetadataRegistry {
    path: PathBuf,
    records: Mutex<BTreeMap<String, DatasetRecord>>,
}

impl MetadataRegistry {
    /// Hydrates the registry from `path`. A missing or unparsable file is
    /// treated as a first run and yields an empty registry.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => parse_records(&raw, &path),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no registry file, starting empty");
                BTreeMap::new()
            }
        };

        Self {
            path,
            records: Mutex::new(records),
        }
    }

    pub async fn get(&self, name: &str) -> Option<DatasetRecord> {
        self.records.lock().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Inserts or replaces `name`, then rewrites the whole registry file.
    /// If the write fails the in-memory map is restored before returning.
    pub async fn put(&self, name: &str, record: DatasetRecord) -> Result<(), RegistryError> {
        let mut records = self.records.lock().await;
        let previous = records.insert(name.to_string(), record);

        if let Err(e) = persist(&self.path, &records).await {
            match previous {
                Some(prev) => records.insert(name.to_string(), prev),
                None => records.remove(name),
            };
            return Err(e);
        }
        Ok(())
    }
}

fn parse_records(raw: &str, path: &Path) -> BTreeMap<String, DatasetRecord> {
    let entries: BTreeMap<String, Value> = match serde_json::from_str(raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "registry file unreadable, starting empty");
            return BTreeMap::new();
        }
    };

    entries
        .into_iter()
        .filter_map(|(name, value)| match serde_json::from_value(value) {
            Ok(record) => Some((name, record)),
            Err(e) => {
                warn!(dataset = %name, error = %e, "skipping malformed registry entry");
                None
            }
        })
        .collect()
}

async fn persist(path: &Path, records: &BTreeMap<String, DatasetRecord>) -> Result<(), RegistryError> {
    let body = serde_json::to_string_pretty(records)?;
    let persist_err = |source| RegistryError::Persist {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
    }

    // Write beside the target and rename so readers never see a torn file.
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await.map_err(persist_err)?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(persist_err(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;
    use tempfile::tempdir;

    fn record(db: &str, folder: &str) -> DatasetRecord {
        DatasetRecord {
            index_location: db.to_string(),
            source_folder: folder.to_string(),
        }
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() -> Result<()> {
        let dir = tempdir()?;
        let registry = MetadataRegistry::load(dir.path().join("meta.json")).await;
        assert_eq!(registry.len().await, 0);
        assert!(registry.get("anything").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_load_garbage_file_is_empty() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("meta.json");
        fs::write(&path, "")?;
        let registry = MetadataRegistry::load(&path).await;
        assert_eq!(registry.len().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_put_persists_and_reloads() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("meta.json");

        let registry = MetadataRegistry::load(&path).await;
        registry.put("docs_v1", record("databases/docs_v1", "/data/docs")).await?;

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(raw["docs_v1"]["db_path"], "databases/docs_v1");
        assert_eq!(raw["docs_v1"]["folder_path"], "/data/docs");

        let reloaded = MetadataRegistry::load(&path).await;
        assert_eq!(
            reloaded.get("docs_v1").await,
            Some(record("databases/docs_v1", "/data/docs"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_put_replaces_whole_record() -> Result<()> {
        let dir = tempdir()?;
        let registry = MetadataRegistry::load(dir.path().join("meta.json")).await;
        registry.put("docs", record("databases/docs", "/old")).await?;
        registry.put("docs", record("databases/docs", "/new")).await?;

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("docs").await.map(|r| r.source_folder), Some("/new".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back() -> Result<()> {
        let dir = tempdir()?;
        // The registry path is a directory, so the final rename must fail.
        let path = dir.path().join("meta.json");
        fs::create_dir(&path)?;
        fs::write(path.join("occupied"), "x")?;

        let registry = MetadataRegistry::load(&path).await;
        let result = registry.put("docs", record("databases/docs", "/data")).await;

        assert!(matches!(result, Err(RegistryError::Persist { .. })));
        assert!(registry.get("docs").await.is_none());
        assert!(!dir.path().join("meta.json.tmp").exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_keep_every_entry() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("meta.json");
        let registry = std::sync::Arc::new(MetadataRegistry::load(&path).await);

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .put(&format!("ds_{i}"), record(&format!("databases/ds_{i}"), "/data"))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await??;
        }

        let reloaded = MetadataRegistry::load(&path).await;
        assert_eq!(reloaded.len().await, 32);
        for i in 0..32 {
            assert_eq!(
                reloaded.get(&format!("ds_{i}")).await.map(|r| r.index_location),
                Some(format!("databases/ds_{i}"))
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("meta.json");
        fs::write(
            &path,
            r#"{"legacy": "databases/legacy", "good": {"db_path": "databases/good", "folder_path": "/g"}}"#,
        )?;

        let registry = MetadataRegistry::load(&path).await;
        assert!(registry.get("legacy").await.is_none());
        assert!(registry.get("good").await.is_some());
        Ok(())
    }

    #[test]
    fn test_field_lookup() {
        let rec = record("databases/a", "");
        assert_eq!(rec.field("db_path"), Some("databases/a"));
        assert_eq!(rec.field("folder_path"), None);
        assert_eq!(rec.field("owner"), None);
    }
}
