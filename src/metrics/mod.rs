// ============================================================================
// METRICS
// ============================================================================
// Incrementally updatable statistics. Every metric keeps the per-event
// contribution it folded in, so samples can be evicted from a bounded queue
// window without recomputing from scratch.
//
// Metrics carry no locking of their own; they always live behind the lock of
// the StatQueue that owns them.
// ============================================================================

mod aggregate;
mod ratio;

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{StatsError, StatsResult, StoreError};
use crate::event::{StatsEvent, COST, DURATION, PDD};

pub use aggregate::{AggregateMode, FieldAggregate, ValueFormat};
pub use ratio::{AsrMetric, CountMetric, DistinctDestinationMetric};

/// String value reported by metrics that have nothing to report yet
pub const NOT_AVAILABLE: &str = "N/A";

/// Float value reported by metrics that have nothing to report yet
pub const NOT_AVAILABLE_VALUE: f64 = -1.0;

// ----------------------------------------------------------------------------
// Metric Trait
// ----------------------------------------------------------------------------

/// A single incrementally updatable statistic.
pub trait StatMetric: Send + Debug {
    /// The kind this metric was built from (also its key in queue reads).
    fn kind(&self) -> &MetricKind;

    /// Fold one event into the aggregate.
    ///
    /// Fails when the event lacks a field this metric needs; the metric is
    /// left unchanged in that case.
    fn add_event(&mut self, event: &dyn StatsEvent) -> StatsResult<()>;

    /// Take a previously added event back out. Unknown IDs are ignored.
    fn remove_event(&mut self, event_id: &str);

    /// Current value rendered for humans, rounded to `decimals`.
    fn string_value(&self, decimals: u32) -> String;

    /// Current value as a float.
    fn float_value(&self) -> f64;

    /// Encode the accumulated state for persistence.
    fn marshal(&self) -> StatsResult<String>;

    /// Replace the accumulated state with a previously marshalled one.
    fn unmarshal(&mut self, raw: &str) -> StatsResult<()>;
}

pub(crate) fn encode_state<T: Serialize>(kind: &MetricKind, state: &T) -> StatsResult<String> {
    serde_json::to_string(state)
        .map_err(|e| StoreError::serialization(kind.to_string(), e.to_string()).into())
}

pub(crate) fn decode_state<T: DeserializeOwned>(kind: &MetricKind, raw: &str) -> StatsResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| StoreError::serialization(kind.to_string(), e.to_string()).into())
}

/// Round half away from zero to the given number of decimals.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Format a float without trailing zeros after rounding.
pub(crate) fn format_number(value: f64, decimals: u32) -> String {
    let rounded = round_to(value, decimals);
    let mut out = format!("{:.*}", decimals as usize, rounded);
    if out.contains('.') {
        while out.ends_with('0') {
            out.pop();
        }
        if out.ends_with('.') {
            out.pop();
        }
    }
    if out == "-0" {
        out = "0".into();
    }
    out
}

// ----------------------------------------------------------------------------
// Metric Kinds
// ----------------------------------------------------------------------------

/// Every metric a queue can be configured with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetricKind {
    /// Number of events in the window
    Count,
    /// Answer-seizure ratio, percent
    Asr,
    /// Average call duration
    Acd,
    /// Total call duration
    Tcd,
    /// Average post-dial delay
    Pdd,
    /// Average call cost
    Acc,
    /// Total call cost
    Tcc,
    /// Distinct destination count
    Ddc,
    /// Sum of an arbitrary numeric field
    Sum(String),
    /// Average of an arbitrary numeric field
    Average(String),
}

impl MetricKind {
    /// Instantiate an empty metric of this kind.
    pub fn build(&self) -> Box<dyn StatMetric> {
        match self {
            MetricKind::Count => Box::new(CountMetric::new()),
            MetricKind::Asr => Box::new(AsrMetric::new()),
            MetricKind::Ddc => Box::new(DistinctDestinationMetric::new()),
            MetricKind::Acd => Box::new(FieldAggregate::new(
                self.clone(),
                DURATION,
                AggregateMode::Average,
                ValueFormat::Duration,
            )),
            MetricKind::Tcd => Box::new(FieldAggregate::new(
                self.clone(),
                DURATION,
                AggregateMode::Total,
                ValueFormat::Duration,
            )),
            MetricKind::Pdd => Box::new(FieldAggregate::new(
                self.clone(),
                PDD,
                AggregateMode::Average,
                ValueFormat::Duration,
            )),
            MetricKind::Acc => Box::new(FieldAggregate::new(
                self.clone(),
                COST,
                AggregateMode::Average,
                ValueFormat::Number,
            )),
            MetricKind::Tcc => Box::new(FieldAggregate::new(
                self.clone(),
                COST,
                AggregateMode::Total,
                ValueFormat::Number,
            )),
            MetricKind::Sum(field) => Box::new(FieldAggregate::new(
                self.clone(),
                field,
                AggregateMode::Total,
                ValueFormat::Number,
            )),
            MetricKind::Average(field) => Box::new(FieldAggregate::new(
                self.clone(),
                field,
                AggregateMode::Average,
                ValueFormat::Number,
            )),
        }
    }
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Count => write!(f, "count"),
            MetricKind::Asr => write!(f, "asr"),
            MetricKind::Acd => write!(f, "acd"),
            MetricKind::Tcd => write!(f, "tcd"),
            MetricKind::Pdd => write!(f, "pdd"),
            MetricKind::Acc => write!(f, "acc"),
            MetricKind::Tcc => write!(f, "tcc"),
            MetricKind::Ddc => write!(f, "ddc"),
            MetricKind::Sum(field) => write!(f, "sum:{}", field),
            MetricKind::Average(field) => write!(f, "avg:{}", field),
        }
    }
}

impl FromStr for MetricKind {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((name, field)) = s.split_once(':') {
            let field = field.trim();
            if field.is_empty() {
                return Err(unknown_kind(s));
            }
            return match name.to_lowercase().as_str() {
                "sum" => Ok(MetricKind::Sum(field.to_string())),
                "avg" | "average" => Ok(MetricKind::Average(field.to_string())),
                _ => Err(unknown_kind(s)),
            };
        }
        match s.to_lowercase().as_str() {
            "count" => Ok(MetricKind::Count),
            "asr" => Ok(MetricKind::Asr),
            "acd" => Ok(MetricKind::Acd),
            "tcd" => Ok(MetricKind::Tcd),
            "pdd" => Ok(MetricKind::Pdd),
            "acc" => Ok(MetricKind::Acc),
            "tcc" => Ok(MetricKind::Tcc),
            "ddc" => Ok(MetricKind::Ddc),
            _ => Err(unknown_kind(s)),
        }
    }
}

impl TryFrom<String> for MetricKind {
    type Error = StatsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MetricKind> for String {
    fn from(kind: MetricKind) -> Self {
        kind.to_string()
    }
}

fn unknown_kind(s: &str) -> StatsError {
    crate::error::ConfigError::invalid_value("metrics", format!("unknown metric kind '{}'", s)).into()
}
