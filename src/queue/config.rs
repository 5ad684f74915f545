// ----------------------------------------------------------------------------
// Queue Configuration
// ----------------------------------------------------------------------------

use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_QUEUE_MAX_ITEMS, MAX_QUEUE_MAX_ITEMS, MAX_QUEUE_TTL_SECS};
use crate::error::ConfigError;
use crate::event::StatsEvent;
use crate::metrics::MetricKind;

/// Configuration of one stat queue, as read from the persistence gateway.
///
/// Immutable once a queue is built from it; reconfiguring means unloading the
/// queue and loading it again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatQueueConfig {
    pub id: String,

    /// Only events of this tenant match. Empty matches any tenant.
    #[serde(default)]
    pub tenant: String,

    /// Metrics to instantiate, in reporting order
    pub metrics: Vec<MetricKind>,

    /// Persist the metrics of this queue
    #[serde(default)]
    pub store: bool,

    /// Stop the pipeline after this queue matched an event
    #[serde(default)]
    pub blocker: bool,

    /// Pipeline priority, higher runs first
    #[serde(default)]
    pub weight: f64,

    /// All filters must pass for an event to match
    #[serde(default)]
    pub filters: Vec<FieldFilter>,

    #[serde(default)]
    pub capacity: QueueCapacity,
}

impl StatQueueConfig {
    pub fn new(id: impl Into<String>, metrics: Vec<MetricKind>) -> Self {
        Self {
            id: id.into(),
            tenant: String::new(),
            metrics,
            store: false,
            blocker: false,
            weight: 0.0,
            filters: Vec::new(),
            capacity: QueueCapacity::default(),
        }
    }

    pub fn with_store(mut self, store: bool) -> Self {
        self.store = store;
        self
    }

    pub fn with_blocker(mut self, blocker: bool) -> Self {
        self.blocker = blocker;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_capacity(mut self, capacity: QueueCapacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::missing_field("queue.id"));
        }

        if self.metrics.is_empty() {
            return Err(ConfigError::invalid_value(
                format!("queue.{}.metrics", self.id),
                "at least one metric is required",
            ));
        }

        let mut seen = HashSet::new();
        for kind in &self.metrics {
            if !seen.insert(kind) {
                return Err(ConfigError::invalid_value(
                    format!("queue.{}.metrics", self.id),
                    format!("metric '{}' configured twice", kind),
                ));
            }
        }

        if !self.weight.is_finite() {
            return Err(ConfigError::invalid_value(
                format!("queue.{}.weight", self.id),
                "weight must be a finite number",
            ));
        }

        self.capacity.validate(&self.id)?;

        for filter in &self.filters {
            filter.compile().map_err(|message| {
                ConfigError::invalid_value(format!("queue.{}.filters", self.id), message)
            })?;
        }

        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Capacity Policy
// ----------------------------------------------------------------------------

/// Bound on the sample window of a queue.
///
/// `max_items` is always enforced; `ttl` additionally expires samples by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCapacity {
    #[serde(default = "default_max_items")]
    pub max_items: usize,

    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

impl Default for QueueCapacity {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            ttl: None,
        }
    }
}

impl QueueCapacity {
    pub fn items(max_items: usize) -> Self {
        Self { max_items, ttl: None }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn validate(&self, queue_id: &str) -> Result<(), ConfigError> {
        if self.max_items == 0 || self.max_items > MAX_QUEUE_MAX_ITEMS {
            return Err(ConfigError::invalid_value(
                format!("queue.{}.capacity.max_items", queue_id),
                format!("must be between 1 and {}", MAX_QUEUE_MAX_ITEMS),
            ));
        }
        if self.ttl == Some(Duration::ZERO) {
            return Err(ConfigError::invalid_value(
                format!("queue.{}.capacity.ttl", queue_id),
                "ttl must be greater than zero",
            ));
        }
        if self.ttl.is_some_and(|ttl| ttl > Duration::from_secs(MAX_QUEUE_TTL_SECS)) {
            return Err(ConfigError::invalid_value(
                format!("queue.{}.capacity.ttl", queue_id),
                format!("ttl must not exceed {}", humantime::format_duration(Duration::from_secs(MAX_QUEUE_TTL_SECS))),
            ));
        }
        Ok(())
    }
}

fn default_max_items() -> usize {
    DEFAULT_QUEUE_MAX_ITEMS
}

// ----------------------------------------------------------------------------
// Field Filters
// ----------------------------------------------------------------------------

/// A condition on one event field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldFilter {
    /// Field is present and non-empty
    Exists { field: String },
    /// Field equals one of the values
    Equals { field: String, values: Vec<String> },
    /// Field is absent or equals none of the values
    NotEquals { field: String, values: Vec<String> },
    /// Field starts with one of the prefixes
    Prefix { field: String, prefixes: Vec<String> },
    /// Field matches the regular expression
    Regex { field: String, pattern: String },
}

impl FieldFilter {
    pub fn exists(field: impl Into<String>) -> Self {
        FieldFilter::Exists { field: field.into() }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        FieldFilter::Equals {
            field: field.into(),
            values: vec![value.into()],
        }
    }

    pub fn prefix(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        FieldFilter::Prefix {
            field: field.into(),
            prefixes: vec![prefix.into()],
        }
    }

    pub(crate) fn compile(&self) -> Result<CompiledFilter, String> {
        let regex = match self {
            FieldFilter::Regex { pattern, field } => Some(
                Regex::new(pattern)
                    .map_err(|e| format!("invalid regex for field {}: {}", field, e))?,
            ),
            _ => None,
        };
        Ok(CompiledFilter {
            filter: self.clone(),
            regex,
        })
    }
}

/// A filter with its regex pre-compiled.
#[derive(Debug, Clone)]
pub(crate) struct CompiledFilter {
    filter: FieldFilter,
    regex: Option<Regex>,
}

impl CompiledFilter {
    /// `Err` carries the reason the event was rejected.
    pub(crate) fn check(&self, event: &dyn StatsEvent) -> Result<(), String> {
        let passed = match &self.filter {
            FieldFilter::Exists { field } => event.field(field).is_some_and(|v| !v.is_empty()),
            FieldFilter::Equals { field, values } => event
                .field(field)
                .is_some_and(|v| values.iter().any(|expected| expected == v)),
            FieldFilter::NotEquals { field, values } => event
                .field(field)
                .map_or(true, |v| values.iter().all(|excluded| excluded != v)),
            FieldFilter::Prefix { field, prefixes } => event
                .field(field)
                .is_some_and(|v| prefixes.iter().any(|p| v.starts_with(p.as_str()))),
            FieldFilter::Regex { field, .. } => match (&self.regex, event.field(field)) {
                (Some(re), Some(v)) => re.is_match(v),
                _ => false,
            },
        };
        if passed {
            Ok(())
        } else {
            Err(format!("filter {:?} failed", self.filter))
        }
    }
}
