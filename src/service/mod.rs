// ============================================================================
// STAT SERVICE
// ============================================================================
// Routes events through the cached queues in pipeline order, answers metric
// reads and owns the background persistence loop.
//
// Lifecycle: Unstarted -> Running -> ShuttingDown -> Stopped. Events are
// accepted until shutdown is requested; shutdown waits for in-flight events,
// stops the loop and runs one final flush before reporting Stopped.
// ============================================================================

mod dispatch;
mod persistence;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServiceConfig;
use crate::error::{StatsError, StatsResult};
use crate::event::StatsEvent;
use crate::queue::{LoadReport, QueueRegistry};
use crate::store::{with_deadline, DataStore};

pub use dispatch::{ArgsLoadQueues, ArgsUnloadQueues, RpcFailure, RpcRequest, RpcResponse, StatsDispatcher, StatsMethod};
pub use persistence::FlushReport;
use persistence::Persister;

// ----------------------------------------------------------------------------
// Service State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ServiceState {
    Unstarted = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl ServiceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ServiceState::Unstarted,
            1 => ServiceState::Running,
            2 => ServiceState::ShuttingDown,
            _ => ServiceState::Stopped,
        }
    }

    pub fn accepts_events(&self) -> bool {
        matches!(self, ServiceState::Unstarted | ServiceState::Running)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Unstarted => write!(f, "unstarted"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::ShuttingDown => write!(f, "shutting_down"),
            ServiceState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Where an event went.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventOutcome {
    /// Queues that folded the event in, in visiting order
    pub matched: Vec<String>,
    /// Blocker queue that ended the walk
    pub blocked_by: Option<String>,
}

// ----------------------------------------------------------------------------
// StatService
// ----------------------------------------------------------------------------

/// The stats service.
pub struct StatService {
    config: ServiceConfig,
    store: Arc<dyn DataStore>,
    registry: Arc<QueueRegistry>,
    persister: Arc<Persister>,
    state: AtomicU8,
    in_flight: AtomicUsize,
    drained: Notify,
    stop_loop: Arc<Notify>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps the in-flight count raised while an event is being processed.
struct InFlightGuard<'a> {
    service: &'a StatService,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.service.in_flight.fetch_sub(1, AtomicOrdering::SeqCst) == 1 {
            self.service.drained.notify_one();
        }
    }
}

impl StatService {
    pub fn new(config: ServiceConfig, store: Arc<dyn DataStore>) -> Self {
        let registry = Arc::new(QueueRegistry::new());
        let persister = Arc::new(Persister::new(registry.clone(), store.clone(), &config));
        Self {
            config,
            store,
            registry,
            persister,
            state: AtomicU8::new(ServiceState::Unstarted as u8),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            stop_loop: Arc::new(Notify::new()),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(AtomicOrdering::SeqCst))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    fn ensure_accepting(&self) -> StatsResult<()> {
        if self.state().accepts_events() {
            Ok(())
        } else {
            Err(StatsError::ServiceStopping)
        }
    }

    fn enter(&self) -> StatsResult<InFlightGuard<'_>> {
        // raise the count before looking at the state so shutdown cannot
        // miss an event that passed the check
        self.in_flight.fetch_add(1, AtomicOrdering::SeqCst);
        let guard = InFlightGuard { service: self };
        self.ensure_accepting()?;
        Ok(guard)
    }

    /// Load the configured queues (when enabled) and spawn the persistence
    /// loop. Starting a running service is a no-op.
    pub async fn start(&self) -> StatsResult<()> {
        match self.state() {
            ServiceState::Unstarted => {}
            ServiceState::Running => return Ok(()),
            _ => return Err(StatsError::ServiceStopping),
        }

        info!(
            target: "statq::service",
            instance = %self.config.instance_name,
            backend = self.store.name(),
            "Starting stat service"
        );

        if self.config.load_on_start {
            match self.load_queues(None).await {
                Ok(report) => info!(
                    target: "statq::service",
                    loaded = report.loaded.len(),
                    failed = report.failed.len(),
                    "Configured queues loaded"
                ),
                Err(StatsError::NotFound) => {
                    info!(target: "statq::service", "No queues configured")
                }
                Err(e) => warn!(
                    target: "statq::service",
                    error = %e,
                    "Loading configured queues failed, starting without them"
                ),
            }
        }

        if self.persister.is_periodic() {
            let handle = self.persister.clone().spawn(self.stop_loop.clone());
            *self.loop_handle.lock() = Some(handle);
        } else {
            info!(target: "statq::service", "Persistence loop disabled, storing on shutdown only");
        }

        let started = self.state.compare_exchange(
            ServiceState::Unstarted as u8,
            ServiceState::Running as u8,
            AtomicOrdering::SeqCst,
            AtomicOrdering::SeqCst,
        );
        if started.is_err() {
            // shutdown was requested while starting
            self.stop_loop.notify_one();
            return Err(StatsError::ServiceStopping);
        }
        Ok(())
    }

    /// Feed an event through every queue in pipeline order.
    pub fn process_event(&self, event: &dyn StatsEvent) -> StatsResult<EventOutcome> {
        let _guard = self.enter()?;

        let event_id = event.id();
        if event_id.is_empty() {
            return Err(StatsError::MissingId);
        }

        let mut outcome = EventOutcome::default();
        for queue in self.registry.ordered() {
            match queue.process_event(event) {
                Ok(_) => {
                    outcome.matched.push(queue.id().to_string());
                    if queue.is_blocker() {
                        outcome.blocked_by = Some(queue.id().to_string());
                        break;
                    }
                }
                Err(e @ StatsError::NotMatched { .. }) => trace!(
                    target: "statq::service",
                    queue_id = %queue.id(),
                    event_id = %event_id,
                    reason = %e,
                    "Event not matched"
                ),
                Err(e) => warn!(
                    target: "statq::service",
                    queue_id = %queue.id(),
                    event_id = %event_id,
                    error = %e,
                    hint = ?e.recovery_hint(),
                    "Ignoring event"
                ),
            }
        }

        debug!(
            target: "statq::service",
            event_id = %event_id,
            event_time = ?event.time(),
            matched = outcome.matched.len(),
            "Event processed"
        );
        Ok(outcome)
    }

    /// IDs of every cached queue, in pipeline order.
    pub fn list_queue_ids(&self) -> StatsResult<Vec<String>> {
        let ids = self.registry.ids();
        if ids.is_empty() {
            return Err(StatsError::NotFound);
        }
        Ok(ids)
    }

    pub fn get_string_metrics(&self, queue_id: &str) -> StatsResult<HashMap<String, String>> {
        let queue = self.registry.get(queue_id).ok_or(StatsError::NotFound)?;
        Ok(queue.string_metrics(self.config.rounding_decimals))
    }

    pub fn get_float_metrics(&self, queue_id: &str) -> StatsResult<HashMap<String, f64>> {
        let queue = self.registry.get(queue_id).ok_or(StatsError::NotFound)?;
        Ok(queue.float_metrics())
    }

    /// Load queues from the store. `None` loads every configured queue.
    pub async fn load_queues(&self, queue_ids: Option<Vec<String>>) -> StatsResult<LoadReport> {
        self.ensure_accepting()?;

        let ids = match queue_ids {
            Some(ids) => ids,
            None => with_deadline("keys_for_prefix", self.config.load_timeout, self.store.queue_ids()).await?,
        };
        if ids.is_empty() {
            return Err(StatsError::NotFound);
        }

        let mut report = self
            .registry
            .load(self.store.as_ref(), &ids, self.config.load_timeout)
            .await;
        if report.is_total_failure() {
            return Err(report.take_error().unwrap_or(StatsError::NotFound));
        }
        Ok(report)
    }

    /// Remove queues from the registry, writing their unsaved state first
    /// on a best-effort basis. Returns the IDs that were cached.
    pub async fn unload_queues(&self, queue_ids: &[String]) -> StatsResult<Vec<String>> {
        self.ensure_accepting()?;

        let mut removed = Vec::new();
        for id in queue_ids {
            let Some(queue) = self.registry.unload(id) else {
                continue;
            };
            if let Err(e) = self.persister.flush_queue(&queue).await {
                warn!(
                    target: "statq::service",
                    queue_id = %id,
                    error = %e,
                    "Unsaved metrics of unloaded queue were lost"
                );
            }
            removed.push(id.clone());
        }

        if removed.is_empty() {
            return Err(StatsError::NotFound);
        }
        info!(target: "statq::service", unloaded = removed.len(), "Queues unloaded");
        Ok(removed)
    }

    /// Run one persistence pass now.
    pub async fn store_queues(&self) -> FlushReport {
        self.persister.flush().await
    }

    /// Stop accepting events, wait for in-flight ones, stop the persistence
    /// loop and flush everything dirty. Returns the final flush report.
    pub async fn shutdown(&self) -> StatsResult<FlushReport> {
        let previous = self.state.swap(ServiceState::ShuttingDown as u8, AtomicOrdering::SeqCst);
        if !ServiceState::from_u8(previous).accepts_events() {
            // already stopping; keep the later state
            self.state.store(previous, AtomicOrdering::SeqCst);
            return Err(StatsError::ServiceStopping);
        }

        info!(target: "statq::service", "Service shutdown initialized");
        let started = Instant::now();
        let deadline = started + self.config.shutdown_timeout;

        while self.in_flight.load(AtomicOrdering::SeqCst) > 0 {
            let notified = self.drained.notified();
            if self.in_flight.load(AtomicOrdering::SeqCst) == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, notified).await.is_err() {
                warn!(
                    target: "statq::service",
                    in_flight = self.in_flight.load(AtomicOrdering::SeqCst),
                    "Shutdown grace period elapsed with events still in flight"
                );
                break;
            }
        }

        self.stop_loop.notify_one();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(target: "statq::service", error = %e, "Persistence loop ended abnormally");
            }
        }

        let report = self.persister.flush().await;
        self.state.store(ServiceState::Stopped as u8, AtomicOrdering::SeqCst);

        info!(
            target: "statq::service",
            stored = report.stored.len(),
            failed = report.failed.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Service shutdown complete"
        );
        Ok(report)
    }
}

impl fmt::Debug for StatService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatService")
            .field("instance", &self.config.instance_name)
            .field("state", &self.state())
            .field("queues", &self.registry.len())
            .field("backend", &self.store.name())
            .finish()
    }
}
