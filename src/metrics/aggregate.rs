//! Field aggregates: totals and averages over one numeric or duration field.
//!
//! ACD, TCD, PDD, ACC, TCC and the generic `sum:<field>` / `avg:<field>` kinds
//! are all the same shape: keep each event's value, report the total or mean.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{decode_state, encode_state, format_number, round_to, MetricKind, StatMetric, NOT_AVAILABLE, NOT_AVAILABLE_VALUE};
use crate::error::StatsResult;
use crate::event::StatsEvent;

/// How the per-event values are folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMode {
    Total,
    Average,
}

/// How the field is parsed and the value rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    /// Plain number (costs, counters)
    Number,
    /// Duration, reported in seconds as a float and humantime as a string
    Duration,
}

/// Total or average of one event field over the queue window.
#[derive(Debug, Clone)]
pub struct FieldAggregate {
    kind: MetricKind,
    field: String,
    mode: AggregateMode,
    format: ValueFormat,
    state: AggregateState,
    /// Running sum of `state.values`
    total: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AggregateState {
    /// event id -> value (seconds for durations)
    values: BTreeMap<String, f64>,
}

impl FieldAggregate {
    pub fn new(kind: MetricKind, field: impl Into<String>, mode: AggregateMode, format: ValueFormat) -> Self {
        Self {
            kind,
            field: field.into(),
            mode,
            format,
            state: AggregateState::default(),
            total: 0.0,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    fn value(&self) -> Option<f64> {
        match self.mode {
            AggregateMode::Total => Some(self.total),
            AggregateMode::Average if self.state.values.is_empty() => None,
            AggregateMode::Average => Some(self.total / self.state.values.len() as f64),
        }
    }

    fn take_back(&mut self, value: f64) {
        if self.state.values.is_empty() {
            // no rounding residue once the window is empty
            self.total = 0.0;
        } else {
            self.total -= value;
        }
    }
}

impl StatMetric for FieldAggregate {
    fn kind(&self) -> &MetricKind {
        &self.kind
    }

    fn add_event(&mut self, event: &dyn StatsEvent) -> StatsResult<()> {
        let metric = self.kind.to_string();
        let value = match self.format {
            ValueFormat::Number => event.float_field(&metric, &self.field)?,
            ValueFormat::Duration => event.duration_field(&metric, &self.field)?.as_secs_f64(),
        };
        if let Some(previous) = self.state.values.insert(event.id().to_string(), value) {
            self.take_back(previous);
        }
        self.total += value;
        Ok(())
    }

    fn remove_event(&mut self, event_id: &str) {
        if let Some(value) = self.state.values.remove(event_id) {
            self.take_back(value);
        }
    }

    fn string_value(&self, decimals: u32) -> String {
        let Some(value) = self.value() else {
            return NOT_AVAILABLE.to_string();
        };
        match self.format {
            ValueFormat::Number => format_number(value, decimals),
            ValueFormat::Duration => {
                let secs = round_to(value, decimals).max(0.0);
                match Duration::try_from_secs_f64(secs) {
                    Ok(duration) => humantime::format_duration(duration).to_string(),
                    // beyond what a Duration holds
                    Err(_) => format!("{}s", format_number(secs, decimals)),
                }
            }
        }
    }

    fn float_value(&self) -> f64 {
        self.value().unwrap_or(NOT_AVAILABLE_VALUE)
    }

    fn marshal(&self) -> StatsResult<String> {
        encode_state(&self.kind, &self.state)
    }

    fn unmarshal(&mut self, raw: &str) -> StatsResult<()> {
        self.state = decode_state(&self.kind, raw)?;
        self.total = self.state.values.values().sum();
        Ok(())
    }
}
