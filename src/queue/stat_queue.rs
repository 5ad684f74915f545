// ----------------------------------------------------------------------------
// StatQueue
// ----------------------------------------------------------------------------

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::{CompiledFilter, StatQueueConfig};
use crate::error::{ConfigError, StatsError, StatsResult};
use crate::event::StatsEvent;
use crate::metrics::{MetricKind, StatMetric};
use crate::store::StoredMetrics;

/// One sample held in the queue window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of a matched event.
#[derive(Debug, Default)]
pub struct QueueUpdate {
    /// Metrics that folded the event in
    pub updated: Vec<MetricKind>,
    /// Metrics that could not
    pub errors: Vec<StatsError>,
    /// Samples dropped from the window by this update
    pub evicted: usize,
}

struct WindowEntry {
    seq: u64,
    sample: QueuedEvent,
}

struct QueueState {
    metrics: Vec<Box<dyn StatMetric>>,
    /// Samples in arrival order. Entries superseded by a later sample with
    /// the same ID stay behind until they reach the front or a compaction.
    window: VecDeque<WindowEntry>,
    /// event id -> sequence number of its live window entry
    live: HashMap<String, u64>,
    next_seq: u64,
    /// Bumped on every change
    generation: u64,
    /// Generation of the last snapshot that reached the store
    persisted_generation: u64,
}

impl QueueState {
    fn new(metrics: Vec<Box<dyn StatMetric>>) -> Self {
        Self {
            metrics,
            window: VecDeque::new(),
            live: HashMap::new(),
            next_seq: 0,
            generation: 0,
            persisted_generation: 0,
        }
    }

    fn is_dirty(&self) -> bool {
        self.generation != self.persisted_generation
    }

    fn len(&self) -> usize {
        self.live.len()
    }

    fn contains(&self, event_id: &str) -> bool {
        self.live.contains_key(event_id)
    }

    fn forget(&mut self, event_id: &str) {
        for metric in self.metrics.iter_mut() {
            metric.remove_event(event_id);
        }
    }

    fn push(&mut self, sample: QueuedEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(sample.id.clone(), seq);
        self.window.push_back(WindowEntry { seq, sample });

        if self.window.len() > 2 * self.live.len() + 64 {
            let live = &self.live;
            self.window
                .retain(|entry| live.get(&entry.sample.id) == Some(&entry.seq));
        }
    }

    /// Oldest live sample, dropping superseded entries in front of it.
    fn front(&mut self) -> Option<&QueuedEvent> {
        while let Some(entry) = self.window.front() {
            if self.live.get(&entry.sample.id) == Some(&entry.seq) {
                break;
            }
            self.window.pop_front();
        }
        self.window.front().map(|entry| &entry.sample)
    }

    fn evict_front(&mut self) {
        if let Some(entry) = self.window.pop_front() {
            self.live.remove(&entry.sample.id);
            self.forget(&entry.sample.id);
        }
    }

    /// Samples expire in arrival order, so only the front is inspected.
    fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while self
            .front()
            .is_some_and(|s| s.expires_at.is_some_and(|at| at <= now))
        {
            self.evict_front();
            evicted += 1;
        }
        evicted
    }

    fn trim_to(&mut self, max_items: usize) -> usize {
        let mut evicted = 0;
        while self.len() > max_items && self.front().is_some() {
            self.evict_front();
            evicted += 1;
        }
        evicted
    }

    fn samples(&self) -> Vec<QueuedEvent> {
        self.window
            .iter()
            .filter(|entry| self.live.get(&entry.sample.id) == Some(&entry.seq))
            .map(|entry| entry.sample.clone())
            .collect()
    }

    fn reset_window(&mut self, samples: &[QueuedEvent]) {
        self.window.clear();
        self.live.clear();
        for sample in samples {
            self.push(sample.clone());
        }
    }
}

/// A named, capacity-bounded set of metrics fed by matching events.
pub struct StatQueue {
    config: Arc<StatQueueConfig>,
    filters: Vec<CompiledFilter>,
    state: Mutex<QueueState>,
}

impl StatQueue {
    /// Build an empty queue from a validated configuration.
    pub fn new(config: StatQueueConfig) -> StatsResult<Self> {
        config.validate()?;
        let filters = config
            .filters
            .iter()
            .map(|f| f.compile())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|message| ConfigError::invalid_value(format!("queue.{}.filters", config.id), message))?;
        let metrics = config.metrics.iter().map(MetricKind::build).collect();

        Ok(Self {
            config: Arc::new(config),
            filters,
            state: Mutex::new(QueueState::new(metrics)),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &StatQueueConfig {
        &self.config
    }

    pub fn weight(&self) -> f64 {
        self.config.weight
    }

    pub fn is_blocker(&self) -> bool {
        self.config.blocker
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().is_dirty()
    }

    /// Number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(&self, event: &dyn StatsEvent) -> Result<(), String> {
        if !self.config.tenant.is_empty() && self.config.tenant != event.tenant() {
            return Err(format!("tenant '{}' does not match", event.tenant()));
        }
        self.filters.iter().try_for_each(|f| f.check(event))
    }

    /// Feed one event through the queue.
    pub fn process_event(&self, event: &dyn StatsEvent) -> StatsResult<QueueUpdate> {
        self.process_event_at(event, Utc::now())
    }

    /// Feed one event through the queue, taking `now` as the current time
    /// for window expiry.
    pub fn process_event_at(&self, event: &dyn StatsEvent, now: DateTime<Utc>) -> StatsResult<QueueUpdate> {
        self.matches(event)
            .map_err(|reason| StatsError::not_matched(self.id(), reason))?;

        let capacity = self.config.capacity;
        let event_id = event.id();
        let mut update = QueueUpdate::default();
        let mut failed = Vec::new();
        let mut state = self.state.lock();

        update.evicted += state.evict_expired(now);
        let superseded = state.contains(event_id);

        for (idx, metric) in state.metrics.iter_mut().enumerate() {
            match metric.add_event(event) {
                Ok(()) => update.updated.push(metric.kind().clone()),
                Err(e) => {
                    failed.push(idx);
                    update.errors.push(e);
                }
            }
        }

        if !update.updated.is_empty() {
            // the new sample supersedes an older one with the same ID, so
            // metrics that rejected it must drop the old contribution
            if superseded {
                for idx in failed {
                    state.metrics[idx].remove_event(event_id);
                }
            }
            let expires_at = capacity
                .ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .and_then(|ttl| now.checked_add_signed(ttl));
            state.push(QueuedEvent {
                id: event_id.to_string(),
                expires_at,
            });
            update.evicted += state.trim_to(capacity.max_items);
        }

        if !update.updated.is_empty() || update.evicted > 0 {
            state.generation += 1;
        }
        drop(state);

        if update.updated.is_empty() {
            return Err(combine_failures(update.errors));
        }

        for error in &update.errors {
            warn!(
                target: "statq::queue",
                queue_id = %self.config.id,
                event_id = %event.id(),
                error = %error,
                "Metric skipped event"
            );
        }
        if update.evicted > 0 {
            debug!(
                target: "statq::queue",
                queue_id = %self.config.id,
                evicted = update.evicted,
                "Samples evicted from window"
            );
        }

        Ok(update)
    }

    /// Current metric values rendered as strings, keyed by metric kind.
    pub fn string_metrics(&self, decimals: u32) -> HashMap<String, String> {
        let state = self.state.lock();
        state
            .metrics
            .iter()
            .map(|m| (m.kind().to_string(), m.string_value(decimals)))
            .collect()
    }

    /// Current metric values as floats, keyed by metric kind.
    pub fn float_metrics(&self) -> HashMap<String, f64> {
        let state = self.state.lock();
        state
            .metrics
            .iter()
            .map(|m| (m.kind().to_string(), m.float_value()))
            .collect()
    }

    /// Copy of the accumulated state for the persistence loop.
    ///
    /// `None` when the queue is not store-enabled or has nothing unwritten.
    pub fn stored_snapshot(&self) -> Option<StoredMetrics> {
        if !self.config.store {
            return None;
        }
        let state = self.state.lock();
        if !state.is_dirty() {
            return None;
        }

        let mut metrics = BTreeMap::new();
        for metric in &state.metrics {
            match metric.marshal() {
                Ok(raw) => {
                    metrics.insert(metric.kind().to_string(), raw);
                }
                Err(e) => warn!(
                    target: "statq::queue",
                    queue_id = %self.config.id,
                    metric = %metric.kind(),
                    error = %e,
                    "Failed to marshal metric, leaving it out of the snapshot"
                ),
            }
        }

        Some(StoredMetrics {
            queue_id: self.config.id.clone(),
            generation: state.generation,
            metrics,
            window: state.samples(),
        })
    }

    /// Record that the snapshot of `generation` was written.
    ///
    /// The queue stays dirty when it changed after that snapshot was taken.
    pub fn mark_persisted(&self, generation: u64) {
        let mut state = self.state.lock();
        if generation > state.persisted_generation {
            state.persisted_generation = generation.min(state.generation);
        }
    }

    /// Replace the accumulated state with a stored snapshot.
    ///
    /// Metrics missing from the snapshot, or whose state cannot be decoded,
    /// start empty. The restored queue is clean unless the window had to be
    /// trimmed to the current capacity.
    pub fn restore(&self, stored: &StoredMetrics, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        let mut missing = 0usize;

        for metric in state.metrics.iter_mut() {
            let kind = metric.kind().clone();
            match stored.metrics.get(&kind.to_string()) {
                Some(raw) => {
                    if let Err(e) = metric.unmarshal(raw) {
                        warn!(
                            target: "statq::queue",
                            queue_id = %self.config.id,
                            metric = %kind,
                            error = %e,
                            "Stored metric state unreadable, starting empty"
                        );
                        *metric = kind.build();
                    }
                }
                None => missing += 1,
            }
        }

        state.reset_window(&stored.window);
        let evicted = state.evict_expired(now) + state.trim_to(self.config.capacity.max_items);

        state.generation = stored.generation;
        state.persisted_generation = stored.generation;
        if evicted > 0 || missing > 0 {
            state.generation += 1;
        }

        debug!(
            target: "statq::queue",
            queue_id = %self.config.id,
            samples = state.len(),
            evicted,
            "Queue restored from stored metrics"
        );
    }
}

impl std::fmt::Debug for StatQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatQueue")
            .field("id", &self.config.id)
            .field("weight", &self.config.weight)
            .field("blocker", &self.config.blocker)
            .field("store", &self.config.store)
            .finish()
    }
}

fn combine_failures(mut errors: Vec<StatsError>) -> StatsError {
    if errors.len() == 1 {
        if let Some(only) = errors.pop() {
            return only;
        }
    }
    let mut metrics = Vec::with_capacity(errors.len());
    let mut messages = Vec::with_capacity(errors.len());
    for error in errors {
        match error {
            StatsError::MetricUpdate { metric, message } => {
                metrics.push(metric);
                messages.push(message);
            }
            other => messages.push(other.to_string()),
        }
    }
    StatsError::metric_update(metrics.join(","), messages.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChargingEvent, COST, DESTINATION, DISCONNECT_CAUSE, DURATION};
    use crate::queue::{FieldFilter, QueueCapacity};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn call(id: &str, cause: &str) -> ChargingEvent {
        ChargingEvent::new("cgrates.org", id).with_field(DISCONNECT_CAUSE, cause)
    }

    fn queue(metrics: Vec<MetricKind>) -> StatQueue {
        StatQueue::new(StatQueueConfig::new("Q1", metrics).with_store(true)).unwrap()
    }

    #[test]
    fn test_count_and_asr() {
        let q = queue(vec![MetricKind::Count, MetricKind::Asr]);
        for (id, cause) in [("e1", "200"), ("e2", "486"), ("e3", "200")] {
            q.process_event(&call(id, cause)).unwrap();
        }

        let metrics = q.string_metrics(2);
        assert_eq!(metrics["count"], "3");
        assert_eq!(metrics["asr"], "66.67%");
        assert!(q.is_dirty());
    }

    #[test]
    fn test_not_matched_leaves_queue_clean() {
        let q = StatQueue::new(
            StatQueueConfig::new("Q1", vec![MetricKind::Count])
                .with_tenant("cgrates.org")
                .with_filter(FieldFilter::prefix(DESTINATION, "+49")),
        )
        .unwrap();

        let other_tenant = ChargingEvent::new("itsyscom.com", "e1").with_field(DESTINATION, "+491");
        assert!(matches!(q.process_event(&other_tenant), Err(StatsError::NotMatched { .. })));

        let other_dest = ChargingEvent::new("cgrates.org", "e2").with_field(DESTINATION, "+331");
        assert!(matches!(q.process_event(&other_dest), Err(StatsError::NotMatched { .. })));

        assert!(!q.is_dirty());
        assert_eq!(q.float_metrics()["count"], 0.0);
    }

    #[test]
    fn test_partial_metric_failure_still_updates() {
        let q = queue(vec![MetricKind::Count, MetricKind::Acd]);
        let update = q.process_event(&call("e1", "200")).unwrap();
        assert_eq!(update.updated, vec![MetricKind::Count]);
        assert_eq!(update.errors.len(), 1);
        assert!(q.is_dirty());
    }

    #[test]
    fn test_all_metrics_failing_is_an_error() {
        let q = queue(vec![MetricKind::Acd, MetricKind::Tcc]);
        let err = q.process_event(&call("e1", "200")).unwrap_err();
        match err {
            StatsError::MetricUpdate { metric, .. } => assert_eq!(metric, "acd,tcc"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!q.is_dirty());
        assert!(q.is_empty());
    }

    #[test]
    fn test_duplicate_event_id_replaces_sample() {
        let q = queue(vec![MetricKind::Count, MetricKind::Tcc]);
        let first = ChargingEvent::new("cgrates.org", "e1").with_field(COST, "1");
        let again = ChargingEvent::new("cgrates.org", "e1").with_field(COST, "5");
        q.process_event(&first).unwrap();
        q.process_event(&again).unwrap();

        assert_eq!(q.len(), 1);
        assert_eq!(q.float_metrics()["tcc"], 5.0);
    }

    #[test]
    fn test_duplicate_rejected_by_every_metric_keeps_old_sample() {
        let q = queue(vec![MetricKind::Tcc]);
        q.process_event(&ChargingEvent::new("cgrates.org", "e1").with_field(COST, "1"))
            .unwrap();
        let snapshot = q.stored_snapshot().unwrap();
        q.mark_persisted(snapshot.generation);

        let err = q.process_event(&ChargingEvent::new("cgrates.org", "e1")).unwrap_err();
        assert!(matches!(err, StatsError::MetricUpdate { .. }));
        assert!(!q.is_dirty());
        assert_eq!(q.len(), 1);
        assert_eq!(q.float_metrics()["tcc"], 1.0);
    }

    #[test]
    fn test_duplicate_drops_old_contribution_of_rejecting_metric() {
        let q = queue(vec![MetricKind::Count, MetricKind::Tcc]);
        q.process_event(&ChargingEvent::new("cgrates.org", "e1").with_field(COST, "1"))
            .unwrap();
        q.process_event(&ChargingEvent::new("cgrates.org", "e1")).unwrap();

        let floats = q.float_metrics();
        assert_eq!(floats["count"], 1.0);
        assert_eq!(floats["tcc"], 0.0);
    }

    #[test]
    fn test_repeated_ids_keep_window_bounded() {
        let q = StatQueue::new(
            StatQueueConfig::new("Q1", vec![MetricKind::Count]).with_capacity(QueueCapacity::items(3)),
        )
        .unwrap();
        for _ in 0..1_000 {
            q.process_event(&call("e1", "200")).unwrap();
        }
        for id in ["e2", "e3", "e4"] {
            q.process_event(&call(id, "200")).unwrap();
        }

        assert_eq!(q.len(), 3);
        assert!(q.state.lock().window.len() <= 2 * 3 + 64 + 1);
        let ids: Vec<String> = q.state.lock().samples().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["e2", "e3", "e4"]);
        assert_eq!(q.float_metrics()["count"], 3.0);
    }

    #[test]
    fn test_max_items_evicts_oldest_from_every_metric() {
        let q = StatQueue::new(
            StatQueueConfig::new("Q1", vec![MetricKind::Count, MetricKind::Asr])
                .with_capacity(QueueCapacity::items(2)),
        )
        .unwrap();
        q.process_event(&call("e1", "486")).unwrap();
        q.process_event(&call("e2", "200")).unwrap();
        let update = q.process_event(&call("e3", "200")).unwrap();

        assert_eq!(update.evicted, 1);
        let metrics = q.string_metrics(2);
        assert_eq!(metrics["count"], "2");
        assert_eq!(metrics["asr"], "100%");
    }

    #[test]
    fn test_ttl_expires_samples() {
        let q = StatQueue::new(
            StatQueueConfig::new("Q1", vec![MetricKind::Count, MetricKind::Tcd])
                .with_capacity(QueueCapacity::items(100).with_ttl(Duration::from_secs(60))),
        )
        .unwrap();
        let t0 = Utc::now();
        let ev = |id: &str| ChargingEvent::new("cgrates.org", id).with_field(DURATION, "30");

        q.process_event_at(&ev("e1"), t0).unwrap();
        q.process_event_at(&ev("e2"), t0 + chrono::Duration::seconds(30)).unwrap();
        let update = q.process_event_at(&ev("e3"), t0 + chrono::Duration::seconds(61)).unwrap();

        assert_eq!(update.evicted, 1);
        assert_eq!(q.float_metrics()["count"], 2.0);
        assert_eq!(q.float_metrics()["tcd"], 60.0);
    }

    #[test]
    fn test_resent_sample_moves_to_the_back_of_the_ttl_window() {
        let q = StatQueue::new(
            StatQueueConfig::new("Q1", vec![MetricKind::Count])
                .with_capacity(QueueCapacity::items(100).with_ttl(Duration::from_secs(60))),
        )
        .unwrap();
        let t0 = Utc::now();
        q.process_event_at(&call("e1", "200"), t0).unwrap();
        q.process_event_at(&call("e2", "200"), t0 + chrono::Duration::seconds(10)).unwrap();
        q.process_event_at(&call("e1", "200"), t0 + chrono::Duration::seconds(20)).unwrap();

        let update = q
            .process_event_at(&call("e3", "200"), t0 + chrono::Duration::seconds(75))
            .unwrap();
        assert_eq!(update.evicted, 1);
        assert_eq!(q.float_metrics()["count"], 2.0);
    }

    #[test]
    fn test_expiry_past_the_calendar_end_is_not_tracked() {
        let q = StatQueue::new(
            StatQueueConfig::new("Q1", vec![MetricKind::Count])
                .with_store(true)
                .with_capacity(QueueCapacity::items(10).with_ttl(Duration::from_secs(60))),
        )
        .unwrap();
        let end = DateTime::<Utc>::MAX_UTC;
        q.process_event_at(&call("e1", "200"), end).unwrap();

        let snapshot = q.stored_snapshot().unwrap();
        assert_eq!(snapshot.window[0].expires_at, None);
    }

    #[test]
    fn test_unrepresentable_ttl_is_rejected() {
        let config = StatQueueConfig::new("Q1", vec![MetricKind::Count]).with_capacity(
            QueueCapacity::items(10).with_ttl(Duration::from_secs(1_000_000 * 365 * 24 * 3600)),
        );
        assert!(matches!(StatQueue::new(config), Err(StatsError::Config(_))));
    }

    #[test]
    fn test_store_disabled_never_snapshots() {
        let q = StatQueue::new(StatQueueConfig::new("Q1", vec![MetricKind::Count])).unwrap();
        q.process_event(&call("e1", "200")).unwrap();
        assert!(q.is_dirty());
        assert!(q.stored_snapshot().is_none());
    }

    #[test]
    fn test_update_after_snapshot_keeps_queue_dirty() {
        let q = queue(vec![MetricKind::Count]);
        q.process_event(&call("e1", "200")).unwrap();

        let snapshot = q.stored_snapshot().unwrap();
        q.process_event(&call("e2", "200")).unwrap();
        q.mark_persisted(snapshot.generation);
        assert!(q.is_dirty());

        let snapshot = q.stored_snapshot().unwrap();
        q.mark_persisted(snapshot.generation);
        assert!(!q.is_dirty());
        assert!(q.stored_snapshot().is_none());
    }

    #[test]
    fn test_restore_reproduces_values() {
        let q = queue(vec![MetricKind::Count, MetricKind::Asr, MetricKind::Tcc]);
        for (id, cause) in [("e1", "200"), ("e2", "486")] {
            let ev = call(id, cause).with_field(COST, "0.5");
            q.process_event(&ev).unwrap();
        }
        let snapshot = q.stored_snapshot().unwrap();

        let restored = queue(vec![MetricKind::Count, MetricKind::Asr, MetricKind::Tcc]);
        restored.restore(&snapshot, Utc::now());

        assert_eq!(restored.string_metrics(2), q.string_metrics(2));
        assert_eq!(restored.len(), 2);
        assert!(!restored.is_dirty());

        // evicting a restored sample must take it out of the metrics too
        restored.process_event(&call("e1", "486").with_field(COST, "1")).unwrap();
        assert_eq!(restored.string_metrics(2)["asr"], "0%");
    }

    #[test]
    fn test_restore_with_new_metric_is_dirty() {
        let q = queue(vec![MetricKind::Count]);
        q.process_event(&call("e1", "200")).unwrap();
        let snapshot = q.stored_snapshot().unwrap();

        let widened = queue(vec![MetricKind::Count, MetricKind::Asr]);
        widened.restore(&snapshot, Utc::now());
        assert_eq!(widened.float_metrics()["count"], 1.0);
        assert!(widened.is_dirty());
    }
}
