// ============================================================================
// STATS EVENTS
// ============================================================================
// The read-only view of one charging event that flows through the queues.
// Adapters (session agents, protocol parsers) produce these; the engine never
// mutates them.
// ============================================================================

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StatsError, StatsResult};

// ----------------------------------------------------------------------------
// Well-known field names
// ----------------------------------------------------------------------------

pub const DISCONNECT_CAUSE: &str = "cgr_disconnectcause";
pub const DURATION: &str = "cgr_duration";
pub const PDD: &str = "cgr_pdd";
pub const COST: &str = "cgr_cost";
pub const DESTINATION: &str = "cgr_destination";
pub const SUPPLIER: &str = "cgr_supplier";

/// Disconnect cause of a successfully answered call
pub const ANSWERED_CAUSE: &str = "200";

// ----------------------------------------------------------------------------
// StatsEvent Trait
// ----------------------------------------------------------------------------

/// Read-only key/value view of one charging event.
pub trait StatsEvent: Send + Sync + Debug {
    /// Event identity. Empty means the event has none.
    fn id(&self) -> &str;

    /// Tenant the event belongs to.
    fn tenant(&self) -> &str;

    /// When the event happened, if the adapter knows.
    fn time(&self) -> Option<DateTime<Utc>>;

    /// Look up a field by name.
    fn field(&self, name: &str) -> Option<&str>;

    /// Look up a field that a metric cannot do without.
    fn required_field(&self, metric: &str, name: &str) -> StatsResult<&str> {
        self.field(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| StatsError::metric_update(metric, format!("missing field {}", name)))
    }

    /// Required field parsed as a float.
    fn float_field(&self, metric: &str, name: &str) -> StatsResult<f64> {
        let raw = self.required_field(metric, name)?;
        match raw.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            Ok(_) => Err(StatsError::metric_update(
                metric,
                format!("field {}='{}' is not a finite number", name, raw),
            )),
            Err(e) => Err(StatsError::metric_update(
                metric,
                format!("field {}='{}' is not a number: {}", name, raw, e),
            )),
        }
    }

    /// Required field parsed as a duration.
    fn duration_field(&self, metric: &str, name: &str) -> StatsResult<Duration> {
        let raw = self.required_field(metric, name)?;
        parse_duration(raw).ok_or_else(|| {
            StatsError::metric_update(metric, format!("field {}='{}' is not a duration", name, raw))
        })
    }
}

/// Parse a duration given either as plain seconds (`"20"`, `"1.5"`) or as a
/// humantime string (`"1m30s"`, `"250ms"`).
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    humantime::parse_duration(raw).ok()
}

// ----------------------------------------------------------------------------
// Charging Event
// ----------------------------------------------------------------------------

/// Concrete event accepted over RPC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChargingEvent {
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub event: HashMap<String, String>,
}

impl ChargingEvent {
    pub fn new(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            time: None,
            event: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.event.insert(name.into(), value.into());
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }
}

impl StatsEvent for ChargingEvent {
    fn id(&self) -> &str {
        &self.id
    }

    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.event.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("20", Some(Duration::from_secs(20)))]
    #[case("1.5", Some(Duration::from_millis(1500)))]
    #[case("1m30s", Some(Duration::from_secs(90)))]
    #[case("250ms", Some(Duration::from_millis(250)))]
    #[case("-3", None)]
    #[case("1e30", None)]
    #[case("NaN", None)]
    #[case("soon", None)]
    fn test_parse_duration(#[case] raw: &str, #[case] expected: Option<Duration>) {
        assert_eq!(parse_duration(raw), expected);
    }

    #[test]
    fn test_required_field_rejects_empty_values() {
        let ev = ChargingEvent::new("cgrates.org", "e1").with_field(DURATION, "");
        let err = ev.required_field("acd", DURATION).unwrap_err();
        assert!(matches!(err, StatsError::MetricUpdate { .. }));
    }

    #[test]
    fn test_float_field_parse_error_names_the_field() {
        let ev = ChargingEvent::new("cgrates.org", "e1").with_field(COST, "abc");
        let err = ev.float_field("tcc", COST).unwrap_err();
        assert!(err.to_string().contains("cgr_cost"));
    }

    #[test]
    fn test_oversized_duration_is_a_metric_error() {
        let ev = ChargingEvent::new("cgrates.org", "e1").with_field(DURATION, "1e30");
        let err = ev.duration_field("acd", DURATION).unwrap_err();
        assert!(matches!(err, StatsError::MetricUpdate { .. }));
        assert!(err.to_string().contains("not a duration"));
    }

    #[test]
    fn test_event_deserializes_from_json() {
        let raw = r#"{"tenant":"cgrates.org","id":"e1",
            "event":{"cgr_disconnectcause":"200","cgr_duration":"20"}}"#;
        let ev: ChargingEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.id(), "e1");
        assert_eq!(ev.field(DISCONNECT_CAUSE), Some("200"));
        assert_eq!(ev.time(), None);
    }
}
