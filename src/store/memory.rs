use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::DataStore;
use crate::error::{StoreError, StoreResult};

/// Process-local store backed by a concurrent map.
///
/// Supports write-failure and latency injection so persistence behaviour can
/// be exercised without a real backend.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, String>,
    fail_writes: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
    writes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, AtomicOrdering::SeqCst);
    }

    /// Delay every following write by `delay`.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    /// Successful writes so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(AtomicOrdering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read_key(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn write_key(&self, key: &str, value: String) -> StoreResult<()> {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::write_failed(key, "write failure injected"));
        }
        self.entries.insert(key.to_string(), value);
        self.writes.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    async fn keys_for_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_failure_keeps_previous_value() {
        let store = InMemoryStore::new();
        store.write_key("sqm_Q1", "v1".into()).await.unwrap();

        store.set_fail_writes(true);
        assert!(store.write_key("sqm_Q1", "v2".into()).await.is_err());
        assert_eq!(store.read_key("sqm_Q1").await.unwrap().as_deref(), Some("v1"));

        store.set_fail_writes(false);
        store.write_key("sqm_Q1", "v2".into()).await.unwrap();
        assert_eq!(store.writes(), 2);
    }
}
