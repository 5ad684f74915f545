// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "statq-engine";
pub const ENGINE_FULL_NAME: &str = "StatQ Real-Time Stats Engine";

// ----------------------------------------------------------------------------
// Queue Limits
// ----------------------------------------------------------------------------

/// Samples a queue keeps when its capacity is not configured
pub const DEFAULT_QUEUE_MAX_ITEMS: usize = 10_000;

/// Upper bound on a configured queue capacity
pub const MAX_QUEUE_MAX_ITEMS: usize = 10_000_000;

/// Longest sample TTL a queue accepts (100 years)
pub const MAX_QUEUE_TTL_SECS: u64 = 100 * 365 * 24 * 3600;

// ----------------------------------------------------------------------------
// Timing
// ----------------------------------------------------------------------------

/// Default interval between persistence passes
pub const DEFAULT_STORE_INTERVAL_MS: u64 = 10_000;

/// Default upper bound of the random delay added to each interval
pub const DEFAULT_STORE_JITTER_MS: u64 = 500;

/// Default deadline for one snapshot write
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

/// Default deadline for reading one queue at load time
pub const DEFAULT_LOAD_TIMEOUT_MS: u64 = 10_000;

/// Grace period for in-flight events during shutdown
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Formatting
// ----------------------------------------------------------------------------

/// Decimals string metrics are rounded to
pub const DEFAULT_ROUNDING_DECIMALS: u32 = 2;

pub const MAX_ROUNDING_DECIMALS: u32 = 10;

/// Reply of RPC calls that return no data
pub const REPLY_OK: &str = "OK";
