// ----------------------------------------------------------------------------
// Persistence Loop
// ----------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::StoreResult;
use crate::queue::{QueueRegistry, StatQueue};
use crate::store::{with_deadline, DataStore};

/// Outcome of one persistence pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushReport {
    /// Queues whose snapshot was written
    pub stored: Vec<String>,
    /// Queue ID -> write error; these stay dirty
    pub failed: BTreeMap<String, String>,
    /// Queues with nothing to write
    pub clean: usize,
}

impl FlushReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Writes dirty, store-enabled queues to the backing store.
pub(crate) struct Persister {
    registry: Arc<QueueRegistry>,
    store: Arc<dyn DataStore>,
    interval: Duration,
    jitter: Duration,
    store_timeout: Duration,
    rng: Mutex<StdRng>,
    /// Held from snapshot to `mark_persisted` so an older snapshot can never
    /// land after a newer one
    write_lock: AsyncMutex<()>,
}

impl Persister {
    pub(crate) fn new(registry: Arc<QueueRegistry>, store: Arc<dyn DataStore>, config: &ServiceConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            registry,
            store,
            interval: config.store_interval,
            jitter: config.store_jitter,
            store_timeout: config.store_timeout,
            rng: Mutex::new(rng),
            write_lock: AsyncMutex::new(()),
        }
    }

    pub(crate) fn is_periodic(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Interval plus a random share of the jitter.
    pub(crate) fn next_delay(&self) -> Duration {
        let max = self.jitter.as_nanos().min(u64::MAX as u128) as u64;
        let extra = if max == 0 { 0 } else { self.rng.lock().gen_range(0..=max) };
        self.interval + Duration::from_nanos(extra)
    }

    /// Write one queue if it has an unwritten snapshot. Returns whether a
    /// write happened.
    pub(crate) async fn flush_queue(&self, queue: &StatQueue) -> StoreResult<bool> {
        let _serial = self.write_lock.lock().await;
        let Some(snapshot) = queue.stored_snapshot() else {
            return Ok(false);
        };
        with_deadline(
            "set_stored_metrics",
            self.store_timeout,
            self.store.set_stored_metrics(&snapshot),
        )
        .await?;
        queue.mark_persisted(snapshot.generation);
        Ok(true)
    }

    /// One pass over every cached queue in pipeline order.
    pub(crate) async fn flush(&self) -> FlushReport {
        let started = Instant::now();
        let mut report = FlushReport::default();

        for queue in self.registry.ordered() {
            match self.flush_queue(&queue).await {
                Ok(true) => report.stored.push(queue.id().to_string()),
                Ok(false) => report.clean += 1,
                Err(e) => {
                    warn!(
                        target: "statq::store",
                        queue_id = %queue.id(),
                        backend = self.store.name(),
                        error = %e,
                        recoverable = e.is_recoverable(),
                        hint = ?e.recovery_hint(),
                        "Failed saving stored metrics"
                    );
                    report.failed.insert(queue.id().to_string(), e.to_string());
                }
            }
            tokio::task::yield_now().await;
        }

        debug!(
            target: "statq::store",
            stored = report.stored.len(),
            failed = report.failed.len(),
            clean = report.clean,
            duration_ms = started.elapsed().as_millis() as u64,
            "Persistence pass complete"
        );
        report
    }

    /// Run passes on the configured cadence until `stop` is notified.
    pub(crate) fn spawn(self: Arc<Self>, stop: Arc<Notify>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                target: "statq::store",
                interval_ms = self.interval.as_millis() as u64,
                jitter_ms = self.jitter.as_millis() as u64,
                "Persistence loop started"
            );
            loop {
                let delay = self.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.flush().await;
                    }
                    _ = stop.notified() => {
                        break;
                    }
                }
            }
            info!(target: "statq::store", "Persistence loop stopped");
        })
    }
}
