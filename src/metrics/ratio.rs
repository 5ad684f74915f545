//! Counting metrics: event count, answer-seizure ratio, distinct destinations.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::{decode_state, encode_state, format_number, MetricKind, StatMetric, NOT_AVAILABLE, NOT_AVAILABLE_VALUE};
use crate::error::StatsResult;
use crate::event::{StatsEvent, ANSWERED_CAUSE, DESTINATION, DISCONNECT_CAUSE};

// ----------------------------------------------------------------------------
// Count
// ----------------------------------------------------------------------------

/// Number of events currently in the queue window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountMetric {
    #[serde(skip, default = "count_kind")]
    kind: MetricKind,
    events: BTreeSet<String>,
}

fn count_kind() -> MetricKind {
    MetricKind::Count
}

impl CountMetric {
    pub fn new() -> Self {
        Self {
            kind: MetricKind::Count,
            events: BTreeSet::new(),
        }
    }
}

impl Default for CountMetric {
    fn default() -> Self {
        Self::new()
    }
}

impl StatMetric for CountMetric {
    fn kind(&self) -> &MetricKind {
        &self.kind
    }

    fn add_event(&mut self, event: &dyn StatsEvent) -> StatsResult<()> {
        self.events.insert(event.id().to_string());
        Ok(())
    }

    fn remove_event(&mut self, event_id: &str) {
        self.events.remove(event_id);
    }

    fn string_value(&self, _decimals: u32) -> String {
        self.events.len().to_string()
    }

    fn float_value(&self) -> f64 {
        self.events.len() as f64
    }

    fn marshal(&self) -> StatsResult<String> {
        encode_state(&self.kind, self)
    }

    fn unmarshal(&mut self, raw: &str) -> StatsResult<()> {
        let restored: CountMetric = decode_state(&self.kind, raw)?;
        self.events = restored.events;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// ASR
// ----------------------------------------------------------------------------

/// Answer-seizure ratio: percentage of events whose disconnect cause is 200.
///
/// Events without a disconnect cause count as seizures that were not answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrMetric {
    #[serde(skip, default = "asr_kind")]
    kind: MetricKind,
    /// event id -> answered
    events: BTreeMap<String, bool>,
    #[serde(skip)]
    answered: usize,
}

fn asr_kind() -> MetricKind {
    MetricKind::Asr
}

impl AsrMetric {
    pub fn new() -> Self {
        Self {
            kind: MetricKind::Asr,
            events: BTreeMap::new(),
            answered: 0,
        }
    }

    fn ratio(&self) -> Option<f64> {
        if self.events.is_empty() {
            return None;
        }
        Some(self.answered as f64 * 100.0 / self.events.len() as f64)
    }
}

impl Default for AsrMetric {
    fn default() -> Self {
        Self::new()
    }
}

impl StatMetric for AsrMetric {
    fn kind(&self) -> &MetricKind {
        &self.kind
    }

    fn add_event(&mut self, event: &dyn StatsEvent) -> StatsResult<()> {
        let answered = event
            .field(DISCONNECT_CAUSE)
            .map(|cause| cause.trim() == ANSWERED_CAUSE)
            .unwrap_or(false);
        if self.events.insert(event.id().to_string(), answered) == Some(true) {
            self.answered -= 1;
        }
        if answered {
            self.answered += 1;
        }
        Ok(())
    }

    fn remove_event(&mut self, event_id: &str) {
        if self.events.remove(event_id) == Some(true) {
            self.answered -= 1;
        }
    }

    fn string_value(&self, decimals: u32) -> String {
        match self.ratio() {
            Some(ratio) => format!("{}%", format_number(ratio, decimals)),
            None => NOT_AVAILABLE.to_string(),
        }
    }

    fn float_value(&self) -> f64 {
        self.ratio().unwrap_or(NOT_AVAILABLE_VALUE)
    }

    fn marshal(&self) -> StatsResult<String> {
        encode_state(&self.kind, self)
    }

    fn unmarshal(&mut self, raw: &str) -> StatsResult<()> {
        let restored: AsrMetric = decode_state(&self.kind, raw)?;
        self.answered = restored.events.values().filter(|answered| **answered).count();
        self.events = restored.events;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// DDC
// ----------------------------------------------------------------------------

/// Number of distinct destinations dialled by the events in the window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistinctDestinationMetric {
    #[serde(skip, default = "ddc_kind")]
    kind: MetricKind,
    /// event id -> destination
    events: BTreeMap<String, String>,
    /// destination -> events dialling it
    #[serde(skip)]
    destinations: HashMap<String, usize>,
}

fn ddc_kind() -> MetricKind {
    MetricKind::Ddc
}

impl DistinctDestinationMetric {
    pub fn new() -> Self {
        Self {
            kind: MetricKind::Ddc,
            events: BTreeMap::new(),
            destinations: HashMap::new(),
        }
    }

    fn distinct(&self) -> usize {
        self.destinations.len()
    }

    fn release(&mut self, destination: &str) {
        if let Some(refs) = self.destinations.get_mut(destination) {
            *refs -= 1;
            if *refs == 0 {
                self.destinations.remove(destination);
            }
        }
    }
}

impl Default for DistinctDestinationMetric {
    fn default() -> Self {
        Self::new()
    }
}

impl StatMetric for DistinctDestinationMetric {
    fn kind(&self) -> &MetricKind {
        &self.kind
    }

    fn add_event(&mut self, event: &dyn StatsEvent) -> StatsResult<()> {
        let destination = event.required_field("ddc", DESTINATION)?;
        if let Some(previous) = self.events.insert(event.id().to_string(), destination.to_string()) {
            self.release(&previous);
        }
        *self.destinations.entry(destination.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn remove_event(&mut self, event_id: &str) {
        if let Some(destination) = self.events.remove(event_id) {
            self.release(&destination);
        }
    }

    fn string_value(&self, _decimals: u32) -> String {
        self.distinct().to_string()
    }

    fn float_value(&self) -> f64 {
        self.distinct() as f64
    }

    fn marshal(&self) -> StatsResult<String> {
        encode_state(&self.kind, self)
    }

    fn unmarshal(&mut self, raw: &str) -> StatsResult<()> {
        let restored: DistinctDestinationMetric = decode_state(&self.kind, raw)?;
        self.destinations.clear();
        for destination in restored.events.values() {
            *self.destinations.entry(destination.clone()).or_insert(0) += 1;
        }
        self.events = restored.events;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChargingEvent;

    fn call(id: &str, cause: &str) -> ChargingEvent {
        ChargingEvent::new("cgrates.org", id).with_field(DISCONNECT_CAUSE, cause)
    }

    #[test]
    fn test_asr_two_of_three_answered() {
        let mut asr = AsrMetric::new();
        assert_eq!(asr.string_value(2), NOT_AVAILABLE);
        assert_eq!(asr.float_value(), NOT_AVAILABLE_VALUE);

        asr.add_event(&call("e1", "200")).unwrap();
        asr.add_event(&call("e2", "486")).unwrap();
        asr.add_event(&call("e3", "200")).unwrap();

        assert_eq!(asr.string_value(2), "66.67%");
        assert!((asr.float_value() - 200.0 / 3.0).abs() < 1e-9);

        asr.remove_event("e2");
        assert_eq!(asr.string_value(2), "100%");
    }

    #[test]
    fn test_asr_missing_cause_is_unanswered() {
        let mut asr = AsrMetric::new();
        asr.add_event(&ChargingEvent::new("cgrates.org", "e1")).unwrap();
        assert_eq!(asr.float_value(), 0.0);
    }

    #[test]
    fn test_count_ignores_unknown_removals() {
        let mut count = CountMetric::new();
        assert_eq!(count.string_value(2), "0");
        count.add_event(&call("e1", "200")).unwrap();
        count.remove_event("e9");
        assert_eq!(count.float_value(), 1.0);
    }

    #[test]
    fn test_ddc_requires_destination() {
        let mut ddc = DistinctDestinationMetric::new();
        assert!(ddc.add_event(&call("e1", "200")).is_err());
        assert_eq!(ddc.float_value(), 0.0);

        for (id, dst) in [("e1", "1002"), ("e2", "1003"), ("e3", "1002")] {
            let ev = ChargingEvent::new("cgrates.org", id).with_field(DESTINATION, dst);
            ddc.add_event(&ev).unwrap();
        }
        assert_eq!(ddc.string_value(0), "2");
        ddc.remove_event("e2");
        assert_eq!(ddc.string_value(0), "1");
    }

    #[test]
    fn test_asr_redial_with_same_id_replaces_outcome() {
        let mut asr = AsrMetric::new();
        asr.add_event(&call("e1", "200")).unwrap();
        asr.add_event(&call("e2", "200")).unwrap();
        asr.add_event(&call("e1", "486")).unwrap();
        assert_eq!(asr.string_value(2), "50%");

        asr.remove_event("e1");
        asr.remove_event("e1");
        assert_eq!(asr.string_value(2), "100%");
    }

    #[test]
    fn test_ddc_moved_destination_is_released() {
        let mut ddc = DistinctDestinationMetric::new();
        let dial = |id: &str, dst: &str| ChargingEvent::new("cgrates.org", id).with_field(DESTINATION, dst);
        ddc.add_event(&dial("e1", "1002")).unwrap();
        ddc.add_event(&dial("e1", "1003")).unwrap();
        assert_eq!(ddc.float_value(), 1.0);

        let raw = ddc.marshal().unwrap();
        let mut restored = DistinctDestinationMetric::new();
        restored.unmarshal(&raw).unwrap();
        restored.add_event(&dial("e2", "1003")).unwrap();
        restored.remove_event("e1");
        assert_eq!(restored.float_value(), 1.0);
    }

    #[test]
    fn test_asr_marshal_restores_state() {
        let mut asr = AsrMetric::new();
        asr.add_event(&call("e1", "200")).unwrap();
        asr.add_event(&call("e2", "404")).unwrap();
        let raw = asr.marshal().unwrap();

        let mut restored = AsrMetric::new();
        restored.unmarshal(&raw).unwrap();
        assert_eq!(restored.string_value(2), "50%");
        assert_eq!(restored.kind(), &MetricKind::Asr);
    }
}
