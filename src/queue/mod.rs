// ============================================================================
// STAT QUEUES
// ============================================================================
// A StatQueue owns one configuration's metrics and its bounded sample window.
// The registry caches the live queues and fixes the order events visit them.
//
// Lock order: registry lock is only ever held to copy Arcs out; each queue is
// guarded by its own mutex, taken after the registry lock is released.
// ============================================================================

mod config;
mod registry;
mod stat_queue;

pub use config::{FieldFilter, QueueCapacity, StatQueueConfig};
pub use registry::{LoadReport, QueueRegistry};
pub use stat_queue::{QueueUpdate, QueuedEvent, StatQueue};
