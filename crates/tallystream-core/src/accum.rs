// Aggregation accumulator
//
// Two entry points with identical per-field semantics: `accumulate`
// folds one record into a running total, `merge` folds a partial total
// produced by another worker into this one. merge is commutative and
// associative for sum/count/min/max; first/last are commutative under
// the timestamp tie-break (ties keep the existing value).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::job::Functions;
use crate::record::{num_or_zero, Record};

/// A value remembered together with the timestamp that selected it,
/// for first/last aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedValue {
    pub value: Value,
    pub time: f64,
}

/// Running aggregates for one group key, field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Totals {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub sum: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub count: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub min: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub max: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub first: BTreeMap<String, TimedValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub last: BTreeMap<String, TimedValue>,
}

impl Totals {
    pub fn is_empty(&self) -> bool {
        self.sum.is_empty()
            && self.count.is_empty()
            && self.min.is_empty()
            && self.max.is_empty()
            && self.first.is_empty()
            && self.last.is_empty()
    }

    /// Fold one record into the running totals for the aggregate
    /// functions the job configured. `time` is the record's effective
    /// timestamp (used by first/last).
    pub fn accumulate(&mut self, record: &Record, fun: &Functions, time: f64) {
        for field in &fun.sum {
            *self.sum.entry(field.clone()).or_insert(0.0) += num_or_zero(record.get(field));
        }

        for field in &fun.count {
            *self.count.entry(field.clone()).or_insert(0) += 1;
        }

        for field in &fun.last {
            let incoming = || TimedValue {
                value: record.get(field).cloned().unwrap_or(Value::Null),
                time,
            };
            match self.last.get_mut(field) {
                Some(existing) if existing.time >= time => {}
                Some(existing) => *existing = incoming(),
                None => {
                    self.last.insert(field.clone(), incoming());
                }
            }
        }

        for field in &fun.first {
            let incoming = || TimedValue {
                value: record.get(field).cloned().unwrap_or(Value::Null),
                time,
            };
            match self.first.get_mut(field) {
                Some(existing) if existing.time <= time => {}
                Some(existing) => *existing = incoming(),
                None => {
                    self.first.insert(field.clone(), incoming());
                }
            }
        }

        for field in &fun.min {
            let value = num_or_zero(record.get(field));
            self.min
                .entry(field.clone())
                .and_modify(|m| *m = m.min(value))
                .or_insert(value);
        }

        for field in &fun.max {
            let value = num_or_zero(record.get(field));
            self.max
                .entry(field.clone())
                .and_modify(|m| *m = m.max(value))
                .or_insert(value);
        }
    }

    /// Fold another partial total into this one.
    pub fn merge(&mut self, other: &Totals, fun: &Functions) {
        for field in &fun.sum {
            if let Some(delta) = other.sum.get(field) {
                *self.sum.entry(field.clone()).or_insert(0.0) += delta;
            }
        }

        for field in &fun.count {
            if let Some(delta) = other.count.get(field) {
                *self.count.entry(field.clone()).or_insert(0) += delta;
            }
        }

        for field in &fun.last {
            if let Some(incoming) = other.last.get(field) {
                match self.last.get_mut(field) {
                    Some(existing) if existing.time >= incoming.time => {}
                    Some(existing) => *existing = incoming.clone(),
                    None => {
                        self.last.insert(field.clone(), incoming.clone());
                    }
                }
            }
        }

        for field in &fun.first {
            if let Some(incoming) = other.first.get(field) {
                match self.first.get_mut(field) {
                    Some(existing) if existing.time <= incoming.time => {}
                    Some(existing) => *existing = incoming.clone(),
                    None => {
                        self.first.insert(field.clone(), incoming.clone());
                    }
                }
            }
        }

        for field in &fun.min {
            if let Some(delta) = other.min.get(field) {
                self.min
                    .entry(field.clone())
                    .and_modify(|m| *m = m.min(*delta))
                    .or_insert(*delta);
            }
        }

        for field in &fun.max {
            if let Some(delta) = other.max.get(field) {
                self.max
                    .entry(field.clone())
                    .and_modify(|m| *m = m.max(*delta))
                    .or_insert(*delta);
            }
        }
    }
}
