// ----------------------------------------------------------------------------
// Queue Registry
// ----------------------------------------------------------------------------

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::StatQueue;
use crate::error::{StatsError, StatsResult};
use crate::store::{with_deadline, DataStore};

/// Per-ID outcome of a load request.
#[derive(Debug, Default, Serialize)]
pub struct LoadReport {
    /// Newly instantiated queues
    pub loaded: Vec<String>,
    /// Already cached, left untouched
    pub skipped: Vec<String>,
    /// ID -> reason
    pub failed: BTreeMap<String, String>,
    #[serde(skip)]
    last_error: Option<StatsError>,
}

impl LoadReport {
    fn record_failure(&mut self, id: &str, error: StatsError) {
        self.failed.insert(id.to_string(), error.to_string());
        self.last_error = Some(error);
    }

    /// True when no queue ended up in the registry because of this request
    /// and at least one ID failed.
    pub fn is_total_failure(&self) -> bool {
        self.loaded.is_empty() && self.skipped.is_empty() && !self.failed.is_empty()
    }

    /// The most recent failure, if any.
    pub fn take_error(&mut self) -> Option<StatsError> {
        self.last_error.take()
    }
}

#[derive(Default)]
struct RegistryInner {
    queues: HashMap<String, Arc<StatQueue>>,
    /// Pipeline order, always the same ID set as `queues`
    order: Vec<String>,
}

impl RegistryInner {
    fn resort(&mut self) {
        let queues = &self.queues;
        let mut order: Vec<String> = queues.keys().cloned().collect();
        order.sort_by(|a, b| {
            let wa = queues.get(a).map_or(0.0, |q| q.weight());
            let wb = queues.get(b).map_or(0.0, |q| q.weight());
            wb.partial_cmp(&wa).unwrap_or(Ordering::Equal).then_with(|| a.cmp(b))
        });
        self.order = order;
    }
}

/// In-memory cache of live queues plus their pipeline order.
///
/// The lock only guards the ID set; callers get `Arc`s out and take each
/// queue's own lock afterwards.
#[derive(Default)]
pub struct QueueRegistry {
    inner: RwLock<RegistryInner>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().queues.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<StatQueue>> {
        self.inner.read().queues.get(id).cloned()
    }

    /// IDs in pipeline order.
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    /// Queues in pipeline order: weight descending, then ID ascending.
    pub fn ordered(&self) -> Vec<Arc<StatQueue>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.queues.get(id).cloned())
            .collect()
    }

    /// Add a queue unless one with the same ID is cached. Returns whether it
    /// was added.
    pub fn insert(&self, queue: StatQueue) -> bool {
        let (inserted, _) = self.insert_all(vec![queue]);
        !inserted.is_empty()
    }

    /// Add several queues under one lock and re-sort once. Returns the IDs
    /// added and the IDs that were already cached.
    pub fn insert_all(&self, queues: Vec<StatQueue>) -> (Vec<String>, Vec<String>) {
        let mut inserted = Vec::new();
        let mut present = Vec::new();
        if queues.is_empty() {
            return (inserted, present);
        }

        let mut inner = self.inner.write();
        for queue in queues {
            let id = queue.id().to_string();
            if inner.queues.contains_key(&id) {
                present.push(id);
                continue;
            }
            inner.queues.insert(id.clone(), Arc::new(queue));
            inserted.push(id);
        }
        if !inserted.is_empty() {
            inner.resort();
        }
        (inserted, present)
    }

    /// Remove a queue. No-op when absent.
    pub fn unload(&self, id: &str) -> Option<Arc<StatQueue>> {
        let mut inner = self.inner.write();
        let removed = inner.queues.remove(id)?;
        inner.order.retain(|queued| queued != id);
        Some(removed)
    }

    /// Instantiate every ID that is not cached yet from the store.
    ///
    /// Store reads happen without holding the registry lock; a queue cached
    /// meanwhile by a concurrent load is reported as skipped.
    pub async fn load(&self, store: &dyn DataStore, ids: &[String], deadline: Duration) -> LoadReport {
        let mut report = LoadReport::default();
        let mut seen = HashSet::new();
        let mut fresh = Vec::new();

        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            if self.contains(id) {
                debug!(target: "statq::queue", queue_id = %id, "Queue already cached, skipping");
                report.skipped.push(id.clone());
                continue;
            }
            match load_queue(store, id, deadline).await {
                Ok(queue) => fresh.push(queue),
                Err(e) => {
                    warn!(
                        target: "statq::queue",
                        queue_id = %id,
                        error = %e,
                        category = e.category(),
                        "Failed to load queue"
                    );
                    report.record_failure(id, e);
                }
            }
        }

        let (loaded, raced) = self.insert_all(fresh);
        report.loaded = loaded;
        report.skipped.extend(raced);

        if !report.loaded.is_empty() {
            info!(
                target: "statq::queue",
                loaded = report.loaded.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                total = self.len(),
                "Queues loaded"
            );
        }
        report
    }
}

async fn load_queue(store: &dyn DataStore, id: &str, deadline: Duration) -> StatsResult<StatQueue> {
    let mut config = with_deadline("get_queue_config", deadline, store.get_queue_config(id)).await?;
    if config.id.is_empty() {
        config.id = id.to_string();
    }
    if config.id != id {
        return Err(crate::error::ConfigError::invalid_value(
            format!("queue.{}.id", id),
            format!("stored under '{}' but configured as '{}'", id, config.id),
        )
        .into());
    }

    let queue = StatQueue::new(config)?;
    if let Some(stored) = with_deadline("get_stored_metrics", deadline, store.get_stored_metrics(id)).await? {
        queue.restore(&stored, Utc::now());
    }
    Ok(queue)
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry").field("order", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChargingEvent, DISCONNECT_CAUSE};
    use crate::metrics::MetricKind;
    use crate::queue::StatQueueConfig;
    use crate::store::InMemoryStore;
    use pretty_assertions::assert_eq;

    const DEADLINE: Duration = Duration::from_secs(1);

    fn cfg(id: &str, weight: f64) -> StatQueueConfig {
        StatQueueConfig::new(id, vec![MetricKind::Count, MetricKind::Asr])
            .with_weight(weight)
            .with_store(true)
    }

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_order_is_weight_then_id() {
        let registry = QueueRegistry::new();
        for (id, weight) in [("b", 10.0), ("a", 10.0), ("c", 20.0), ("d", 0.0)] {
            assert!(registry.insert(StatQueue::new(cfg(id, weight)).unwrap()));
        }
        assert_eq!(registry.ids(), ids(&["c", "a", "b", "d"]));
        let ordered: Vec<String> = registry.ordered().iter().map(|q| q.id().to_string()).collect();
        assert_eq!(ordered, registry.ids());
    }

    #[test]
    fn test_insert_never_overwrites() {
        let registry = QueueRegistry::new();
        registry.insert(StatQueue::new(cfg("Q1", 0.0)).unwrap());
        let ev = ChargingEvent::new("cgrates.org", "e1").with_field(DISCONNECT_CAUSE, "200");
        registry.get("Q1").unwrap().process_event(&ev).unwrap();

        assert!(!registry.insert(StatQueue::new(cfg("Q1", 0.0)).unwrap()));
        assert_eq!(registry.get("Q1").unwrap().float_metrics()["count"], 1.0);
    }

    #[test]
    fn test_unload_keeps_order_consistent() {
        let registry = QueueRegistry::new();
        registry.insert(StatQueue::new(cfg("Q1", 0.0)).unwrap());
        registry.insert(StatQueue::new(cfg("Q2", 0.0)).unwrap());

        assert!(registry.unload("Q1").is_some());
        assert!(registry.unload("Q1").is_none());
        assert_eq!(registry.ids(), ids(&["Q2"]));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_load_skips_cached_and_reports_failures() {
        let store = InMemoryStore::new();
        store.set_queue_config(&cfg("Q1", 0.0)).await.unwrap();
        store.set_queue_config(&cfg("Q2", 5.0)).await.unwrap();

        let registry = QueueRegistry::new();
        registry.insert(StatQueue::new(cfg("Q1", 0.0)).unwrap());

        let report = registry.load(&store, &ids(&["Q1", "Q2", "Q9", "Q2"]), DEADLINE).await;
        assert_eq!(report.loaded, ids(&["Q2"]));
        assert_eq!(report.skipped, ids(&["Q1"]));
        assert!(report.failed.contains_key("Q9"));
        assert!(!report.is_total_failure());
        assert_eq!(registry.ids(), ids(&["Q2", "Q1"]));
    }

    #[tokio::test]
    async fn test_load_restores_stored_metrics() {
        let store = InMemoryStore::new();
        store.set_queue_config(&cfg("Q1", 0.0)).await.unwrap();

        let original = StatQueue::new(cfg("Q1", 0.0)).unwrap();
        for (id, cause) in [("e1", "200"), ("e2", "486"), ("e3", "200")] {
            let ev = ChargingEvent::new("cgrates.org", id).with_field(DISCONNECT_CAUSE, cause);
            original.process_event(&ev).unwrap();
        }
        store.set_stored_metrics(&original.stored_snapshot().unwrap()).await.unwrap();

        let registry = QueueRegistry::new();
        let report = registry.load(&store, &ids(&["Q1"]), DEADLINE).await;
        assert_eq!(report.loaded, ids(&["Q1"]));

        let loaded = registry.get("Q1").unwrap();
        assert_eq!(loaded.string_metrics(2), original.string_metrics(2));
        assert!(!loaded.is_dirty());
    }

    #[tokio::test]
    async fn test_load_all_missing_is_total_failure() {
        let store = InMemoryStore::new();
        let registry = QueueRegistry::new();
        let mut report = registry.load(&store, &ids(&["nope"]), DEADLINE).await;
        assert!(report.is_total_failure());
        assert!(matches!(report.take_error(), Some(StatsError::Persistence(_))));
    }
}
