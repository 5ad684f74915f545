// ============================================================================
// PERSISTENCE GATEWAY
// ============================================================================
// Key/value access to queue configurations and stored metric snapshots.
// Values are JSON documents under two key families:
// - `sqc_<ID>`  queue configuration
// - `sqm_<ID>`  stored metrics of a queue
//
// Backends only move raw documents; typed access lives in the trait's
// provided methods. No operation is assumed to be transactional.
// ============================================================================

mod file;
mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::queue::{QueuedEvent, StatQueueConfig};

pub use file::FileStore;
pub use memory::InMemoryStore;

/// Key prefix of queue configurations
pub const QUEUE_CONFIG_PREFIX: &str = "sqc_";

/// Key prefix of stored metric snapshots
pub const STORED_METRICS_PREFIX: &str = "sqm_";

pub fn config_key(queue_id: &str) -> String {
    format!("{}{}", QUEUE_CONFIG_PREFIX, queue_id)
}

pub fn metrics_key(queue_id: &str) -> String {
    format!("{}{}", STORED_METRICS_PREFIX, queue_id)
}

// ----------------------------------------------------------------------------
// Stored Metrics
// ----------------------------------------------------------------------------

/// Persisted state of one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMetrics {
    pub queue_id: String,

    /// Queue generation the snapshot was taken at
    #[serde(default)]
    pub generation: u64,

    /// metric kind -> encoded metric state
    pub metrics: BTreeMap<String, String>,

    /// Sample window, oldest first
    #[serde(default)]
    pub window: Vec<QueuedEvent>,
}

// ----------------------------------------------------------------------------
// DataStore Trait
// ----------------------------------------------------------------------------

/// Backing store of the stats service.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Raw document under `key`, `None` when absent.
    async fn read_key(&self, key: &str) -> StoreResult<Option<String>>;

    /// Replace the document under `key`.
    async fn write_key(&self, key: &str, value: String) -> StoreResult<()>;

    /// All keys starting with `prefix`, sorted.
    async fn keys_for_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Configuration of one queue. `NotFound` when not configured.
    async fn get_queue_config(&self, queue_id: &str) -> StoreResult<StatQueueConfig> {
        let key = config_key(queue_id);
        match self.read_key(&key).await? {
            Some(raw) => decode(&key, &raw),
            None => Err(StoreError::not_found(key)),
        }
    }

    async fn set_queue_config(&self, config: &StatQueueConfig) -> StoreResult<()> {
        let key = config_key(&config.id);
        let raw = encode(&key, config)?;
        self.write_key(&key, raw).await
    }

    /// IDs of every configured queue.
    async fn queue_ids(&self) -> StoreResult<Vec<String>> {
        let keys = self.keys_for_prefix(QUEUE_CONFIG_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(QUEUE_CONFIG_PREFIX).map(str::to_string))
            .filter(|id| !id.is_empty())
            .collect())
    }

    async fn get_stored_metrics(&self, queue_id: &str) -> StoreResult<Option<StoredMetrics>> {
        let key = metrics_key(queue_id);
        match self.read_key(&key).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn set_stored_metrics(&self, snapshot: &StoredMetrics) -> StoreResult<()> {
        let key = metrics_key(&snapshot.queue_id);
        let raw = encode(&key, snapshot)?;
        self.write_key(&key, raw).await
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::serialization(key, e.to_string()))
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::serialization(key, e.to_string()))
}

/// Run a store operation, failing with `Timeout` once `deadline` passes.
pub async fn with_deadline<T, F>(operation: &str, deadline: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::timeout(operation, deadline.as_millis() as u64)),
    }
}
