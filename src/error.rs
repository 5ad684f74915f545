// ============================================================================
// ERROR HANDLING
// ============================================================================
// Error types for every subsystem of the stats engine:
// - Pipeline errors surfaced to RPC callers (the stats taxonomy)
// - Persistence gateway errors
// - Configuration errors
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Core Stats Errors
// ----------------------------------------------------------------------------

/// The main error type of the stats engine.
///
/// RPC-facing calls return either a success value or exactly one of these.
#[derive(Error, Debug)]
pub enum StatsError {
    /// Event carries no identity; rejected before any queue sees it.
    #[error("missing ID field")]
    MissingId,

    /// Event does not satisfy a queue's matching criteria.
    #[error("event not matched by queue '{queue_id}': {reason}")]
    NotMatched { queue_id: String, reason: String },

    /// A metric could not fold the event in.
    #[error("metric '{metric}' failed to update: {message}")]
    MetricUpdate { metric: String, message: String },

    #[error("not found")]
    NotFound,

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("service stopping")]
    ServiceStopping,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("unsupported service method: {0}")]
    UnsupportedMethod(String),

    #[error("invalid arguments for {method}: {message}")]
    InvalidArguments { method: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl StatsError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            StatsError::MissingId => false,
            StatsError::NotMatched { .. } => true,
            StatsError::MetricUpdate { .. } => true,
            StatsError::NotFound => true,
            StatsError::Persistence(e) => e.is_recoverable(),
            StatsError::ServiceStopping => false,
            StatsError::Config(_) => false,
            StatsError::UnsupportedMethod(_) => false,
            StatsError::InvalidArguments { .. } => false,
            StatsError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            StatsError::MissingId => "missing_id",
            StatsError::NotMatched { .. } => "not_matched",
            StatsError::MetricUpdate { .. } => "metric_update",
            StatsError::NotFound => "not_found",
            StatsError::Persistence(_) => "persistence",
            StatsError::ServiceStopping => "shutdown",
            StatsError::Config(_) => "config",
            StatsError::UnsupportedMethod(_) => "unsupported_method",
            StatsError::InvalidArguments { .. } => "invalid_arguments",
            StatsError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            StatsError::NotMatched { .. } | StatsError::MetricUpdate { .. } => RecoveryHint::Skip,
            StatsError::Persistence(e) => e.recovery_hint(),
            StatsError::Config(_) => RecoveryHint::FixConfiguration,
            StatsError::ServiceStopping => RecoveryHint::None,
            StatsError::NotFound => RecoveryHint::None,
            StatsError::Internal(_) => RecoveryHint::AlertOperator,
            _ => RecoveryHint::FixRequest,
        }
    }

    pub fn not_matched(queue_id: impl Into<String>, reason: impl Into<String>) -> Self {
        StatsError::NotMatched {
            queue_id: queue_id.into(),
            reason: reason.into(),
        }
    }

    pub fn metric_update(metric: impl Into<String>, message: impl Into<String>) -> Self {
        StatsError::MetricUpdate {
            metric: metric.into(),
            message: message.into(),
        }
    }

    pub fn invalid_arguments(method: impl Into<String>, message: impl Into<String>) -> Self {
        StatsError::InvalidArguments {
            method: method.into(),
            message: message.into(),
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Leave state dirty, the next persistence pass retries
    RetryNextTick,
    /// Fix configuration and reload
    FixConfiguration,
    /// Caller sent a bad request
    FixRequest,
    /// Skip this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// Persistence Gateway Errors
// ----------------------------------------------------------------------------

/// Errors from the backing key/value store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("read of '{key}' failed: {message}")]
    ReadFailed { key: String, message: String },

    #[error("write of '{key}' failed: {message}")]
    WriteFailed { key: String, message: String },

    #[error("timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("serialization failed for '{key}': {message}")]
    Serialization { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StoreError::Serialization { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            StoreError::NotFound { .. } => RecoveryHint::FixConfiguration,
            StoreError::Serialization { .. } => RecoveryHint::AlertOperator,
            StoreError::Timeout { .. } | StoreError::WriteFailed { .. } => RecoveryHint::RetryNextTick,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        StoreError::NotFound { key: key.into() }
    }

    pub fn write_failed(key: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::WriteFailed {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn read_failed(key: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::ReadFailed {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn serialization(key: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Serialization {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        StoreError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for stats operations
pub type StatsResult<T> = Result<T, StatsError>;

/// Result type for persistence gateway operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts_into_persistence() {
        let err: StatsError = StoreError::write_failed("sqm_Q1", "disk full").into();
        assert_eq!(err.category(), "persistence");
        assert!(err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::RetryNextTick);
        assert_eq!(
            err.to_string(),
            "persistence failure: write of 'sqm_Q1' failed: disk full"
        );
    }

    #[test]
    fn test_store_failure_hints() {
        let timeout = StoreError::Timeout {
            operation: "set_stored_metrics".into(),
            timeout_ms: 20,
        };
        assert_eq!(timeout.recovery_hint(), RecoveryHint::RetryNextTick);
        assert_eq!(
            StoreError::read_failed("sqc_Q1", "connection reset").recovery_hint(),
            RecoveryHint::RetryWithBackoff
        );

        let corrupt = StoreError::Serialization {
            key: "sqm_Q1".into(),
            message: "expected value".into(),
        };
        assert!(!corrupt.is_recoverable());
        assert_eq!(corrupt.recovery_hint(), RecoveryHint::AlertOperator);
    }

    #[test]
    fn test_rejecting_errors_are_not_recoverable() {
        assert!(!StatsError::MissingId.is_recoverable());
        assert!(!StatsError::ServiceStopping.is_recoverable());
        assert_eq!(StatsError::MissingId.to_string(), "missing ID field");
    }

    #[test]
    fn test_per_queue_errors_are_skippable() {
        let err = StatsError::not_matched("Q1", "tenant mismatch");
        assert_eq!(err.recovery_hint(), RecoveryHint::Skip);
        let err = StatsError::metric_update("acd", "missing field cgr_duration");
        assert_eq!(err.category(), "metric_update");
    }
}
