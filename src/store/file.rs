use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::DataStore;
use crate::error::{StoreError, StoreResult};

const DOCUMENT_EXTENSION: &str = "json";

/// Store keeping one JSON document per key under a directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a half-written document.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(target: "statq::store", root = %root.display(), "File store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
        if !valid {
            return Err(StoreError::write_failed(key, "key is not usable as a file name"));
        }
        Ok(self.root.join(format!("{}.{}", key, DOCUMENT_EXTENSION)))
    }
}

#[async_trait]
impl DataStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn read_key(&self, key: &str) -> StoreResult<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::read_failed(key, e.to_string())),
        }
    }

    async fn write_key(&self, key: &str, value: String) -> StoreResult<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension(format!("{}.tmp", DOCUMENT_EXTENSION));
        fs::write(&tmp, value.as_bytes())
            .await
            .map_err(|e| StoreError::write_failed(key, e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::write_failed(key, e.to_string()))
    }

    async fn keys_for_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DOCUMENT_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricKind;
    use crate::queue::StatQueueConfig;
    use crate::store::StoredMetrics;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            let cfg = StatQueueConfig::new("Q1", vec![MetricKind::Count]).with_store(true);
            store.set_queue_config(&cfg).await.unwrap();
            store
                .set_stored_metrics(&StoredMetrics {
                    queue_id: "Q1".into(),
                    generation: 3,
                    metrics: BTreeMap::from([("count".to_string(), r#"{"events":["e1"]}"#.to_string())]),
                    window: Vec::new(),
                })
                .await
                .unwrap();
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(store.queue_ids().await.unwrap(), vec!["Q1"]);
        let stored = store.get_stored_metrics("Q1").await.unwrap().unwrap();
        assert_eq!(stored.generation, 3);
        assert!(store.get_stored_metrics("Q2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_temporary_files_remain() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.write_key("sqm_Q1", "{}".into()).await.unwrap();
        store.write_key("sqm_Q1", "{\"a\":1}".into()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["sqm_Q1.json"]);
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.write_key("../escape", "{}".into()).await.is_err());
        assert!(store.read_key("a/b").await.is_err());
    }
}
