//! # StatQ Engine
//!
//! Real-time statistics aggregation for telecom charging events.
//!
//! Charging events are routed through named, independently configured stat
//! queues. Each queue keeps a bounded window of samples and a set of
//! incrementally updated metrics (call count, ASR, ACD, total cost, ...)
//! that can be read synchronously at any time. Dirty queue state is written
//! periodically to a backing store and restored when a queue is loaded.
//!
//! ## Architecture
//!
//! ```text
//! event ──► StatService::process_event
//!               │  QueueRegistry::ordered()  (weight desc, id asc)
//!               ▼
//!           StatQueue ──► Metric, Metric, ...
//!               │
//!  timer ──► Persister ──► DataStore (memory | file)
//! ```
//!
//! The RPC surface (`StatSV1.*`) is exposed through [`service::StatsDispatcher`].

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod service;
pub mod store;

pub use config::{EngineConfig, LoggingConfig, ServiceConfig, StorageBackend, StorageConfig};
pub use error::{ConfigError, RecoveryHint, StatsError, StatsResult, StoreError, StoreResult};
pub use event::{ChargingEvent, StatsEvent};
pub use logging::init_logging;
pub use metrics::{MetricKind, StatMetric};
pub use queue::{FieldFilter, LoadReport, QueueCapacity, QueueRegistry, StatQueue, StatQueueConfig};
pub use service::{EventOutcome, FlushReport, ServiceState, StatService, StatsDispatcher, StatsMethod};
pub use store::{DataStore, FileStore, InMemoryStore, StoredMetrics};
