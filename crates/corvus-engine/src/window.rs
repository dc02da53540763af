//! Sliding-window state store and aggregation evaluator.
//!
//! Window state lives behind the [`WindowStore`] trait — the narrow seam to
//! an external key-value store. The engine runs as multiple concurrent
//! worker processes, so every update must be a single atomic step on the
//! store side: `record` adds an entry, trims everything older than the
//! window, and returns the aggregate over what remains, all under one lock
//! (or one server-side pipeline for a networked store).
//!
//! Encoding choice: timestamped entries with trim-before-read. This gives
//! exact counts at the cost of one entry per qualifying event; a
//! counter-with-expiry encoding would be cheaper but only approximates the
//! window boundary. Entries are bounded per key to keep a hot group from
//! growing without limit.
//!
//! Delivery is at-least-once: a redelivered event registers again and a
//! crossing may be observed more than once. Deduplication is deliberately
//! not done here — the alert factory folds repeated crossings by dedup key.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::debug;

use corvus_rule::{AggregateFunction, Aggregation};

use crate::condition::CompiledCondition;
use crate::error::{EngineError, Result};
use crate::event::NormalizedEvent;

// =============================================================================
// Store
// =============================================================================

/// Aggregate over the entries retained in one group's window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl WindowSnapshot {
    /// The value the threshold operator is applied to.
    pub fn aggregate(&self, function: AggregateFunction) -> f64 {
        match function {
            AggregateFunction::Count => self.count as f64,
            AggregateFunction::Sum => self.sum,
            AggregateFunction::Average => {
                if self.count == 0 {
                    0.0
                } else {
                    self.sum / self.count as f64
                }
            }
            AggregateFunction::Min => self.min,
            AggregateFunction::Max => self.max,
        }
    }
}

/// Narrow interface to the external window state store.
///
/// Implementations must make `record` atomic with respect to concurrent
/// callers on the same key; read-modify-write without atomicity loses
/// updates when evaluator instances race.
pub trait WindowStore: Send + Sync {
    /// Register one entry for `key` at `timestamp` with the given weight
    /// (1.0 for counting), trim entries older than `window_seconds`, and
    /// return the aggregate over the retained window.
    fn record(
        &self,
        key: &str,
        timestamp: i64,
        weight: f64,
        window_seconds: u64,
    ) -> Result<WindowSnapshot>;

    /// Drop groups whose every entry has expired. Returns how many groups
    /// were removed. Called periodically by a cleanup task.
    fn purge_expired(&self, now: i64) -> Result<usize>;
}

/// In-process implementation of [`WindowStore`].
///
/// A mutex-guarded map of per-group entry deques; the single locked section
/// in `record` is the in-process analogue of a sorted-set add + trim + read
/// pipeline on a networked store. Entries are assumed to arrive roughly in
/// timestamp order within a partition.
pub struct MemoryWindowStore {
    inner: Mutex<HashMap<String, GroupWindow>>,
    max_entries_per_key: usize,
}

struct GroupWindow {
    window_seconds: u64,
    entries: VecDeque<(i64, f64)>,
}

impl GroupWindow {
    fn evict(&mut self, cutoff: i64) {
        while self.entries.front().is_some_and(|(t, _)| *t < cutoff) {
            self.entries.pop_front();
        }
    }

    fn snapshot(&self) -> WindowSnapshot {
        let mut snap = WindowSnapshot {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        };
        for (_, w) in &self.entries {
            snap.count += 1;
            snap.sum += w;
            snap.min = snap.min.min(*w);
            snap.max = snap.max.max(*w);
        }
        if snap.count == 0 {
            snap.min = 0.0;
            snap.max = 0.0;
        }
        snap
    }
}

impl MemoryWindowStore {
    pub fn new(max_entries_per_key: usize) -> Self {
        MemoryWindowStore {
            inner: Mutex::new(HashMap::new()),
            max_entries_per_key,
        }
    }

    /// Number of tracked groups (for monitoring).
    pub fn group_count(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for MemoryWindowStore {
    fn default() -> Self {
        MemoryWindowStore::new(10_000)
    }
}

impl WindowStore for MemoryWindowStore {
    fn record(
        &self,
        key: &str,
        timestamp: i64,
        weight: f64,
        window_seconds: u64,
    ) -> Result<WindowSnapshot> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Store("window store lock poisoned".to_string()))?;

        let group = inner.entry(key.to_string()).or_insert_with(|| GroupWindow {
            window_seconds,
            entries: VecDeque::new(),
        });
        group.window_seconds = window_seconds;

        group.evict(timestamp - window_seconds as i64);
        group.entries.push_back((timestamp, weight));
        while group.entries.len() > self.max_entries_per_key {
            group.entries.pop_front();
        }

        Ok(group.snapshot())
    }

    fn purge_expired(&self, now: i64) -> Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Store("window store lock poisoned".to_string()))?;

        let before = inner.len();
        inner.retain(|_, group| {
            group.evict(now - group.window_seconds as i64);
            !group.entries.is_empty()
        });
        Ok(before - inner.len())
    }
}

// =============================================================================
// Evaluator
// =============================================================================

/// An aggregation compiled alongside its rule: the parsed spec plus a
/// pre-compiled `having` predicate.
#[derive(Debug, Clone)]
pub struct CompiledAggregation {
    pub spec: Aggregation,
    pub having: Option<CompiledCondition>,
}

impl CompiledAggregation {
    pub fn compile(agg: &Aggregation) -> Result<Self> {
        let having = agg
            .having
            .as_deref()
            .map(CompiledCondition::compile)
            .transpose()?;
        Ok(CompiledAggregation {
            spec: agg.clone(),
            having,
        })
    }
}

/// Outcome of one aggregation evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowDecision {
    /// Whether the threshold condition is satisfied.
    pub fired: bool,
    /// Entries currently in the window.
    pub count: u64,
    /// The aggregated value the threshold was compared against.
    pub value: f64,
    /// The fully qualified group key this event registered under.
    pub group_key: String,
}

/// Evaluates aggregations against the window store.
pub struct AggregationEvaluator {
    store: Arc<dyn WindowStore>,
    key_prefix: String,
}

impl AggregationEvaluator {
    pub fn new(store: Arc<dyn WindowStore>, key_prefix: impl Into<String>) -> Self {
        AggregationEvaluator {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    /// Register `event` in the rule's window and decide whether the
    /// threshold is crossed.
    ///
    /// For non-count aggregates an event whose source field is missing or
    /// non-numeric does not register and cannot fire (fail closed).
    pub fn evaluate(
        &self,
        agg: &CompiledAggregation,
        rule_id: &str,
        event: &NormalizedEvent,
        now: i64,
    ) -> Result<WindowDecision> {
        let group_key = self.group_key(rule_id, &agg.spec.group_by, event);

        let weight = match agg.spec.function {
            AggregateFunction::Count => 1.0,
            _ => {
                let field = agg.spec.field.as_deref().ok_or_else(|| {
                    EngineError::InvalidRule(format!(
                        "aggregation for rule '{rule_id}' has no source field"
                    ))
                })?;
                match event.field(field).as_ref().and_then(numeric_value) {
                    Some(n) => n,
                    None => {
                        debug!(rule_id, field, "non-numeric aggregation input; not registered");
                        return Ok(WindowDecision {
                            fired: false,
                            count: 0,
                            value: 0.0,
                            group_key,
                        });
                    }
                }
            }
        };

        let snapshot = self
            .store
            .record(&group_key, now, weight, agg.spec.window_seconds)?;
        let value = snapshot.aggregate(agg.spec.function);

        let mut fired = agg.spec.operator.compare(value, agg.spec.threshold);
        if let Some(having) = &agg.having {
            fired = fired && having.evaluate(event);
        }

        Ok(WindowDecision {
            fired,
            count: snapshot.count,
            value,
            group_key,
        })
    }

    /// Stable, field-name-qualified group key: `prefix:rule-id:f1=v1|f2=v2`.
    ///
    /// Qualifying each value with its field name keeps groups from colliding
    /// when different fields carry the same value; an absent field
    /// serializes as `-` so the key stays stable across events.
    fn group_key(&self, rule_id: &str, group_by: &[String], event: &NormalizedEvent) -> String {
        let parts: Vec<String> = group_by
            .iter()
            .map(|field| {
                let value = event
                    .field(field)
                    .as_ref()
                    .and_then(display_value)
                    .unwrap_or_else(|| "-".to_string());
                format!("{field}={value}")
            })
            .collect();
        format!("{}{}:{}", self.key_prefix, rule_id, parts.join("|"))
    }
}

fn numeric_value(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn display_value(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
