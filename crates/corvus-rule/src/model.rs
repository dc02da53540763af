//! In-memory representation of correlation rules: triggers, conditions,
//! aggregation windows, and response actions.
//!
//! Every enum carries an explicit bidirectional string mapping
//! (`from_str`/`as_str`) so that unknown discriminants are rejected when a
//! rule document is parsed, never at evaluation time.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{ConditionValue, ScalarValue};

// =============================================================================
// Enumerations
// =============================================================================

/// Severity assigned to a rule and inherited by the alerts it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What makes a rule a candidate for an incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// Fires on a matching event type (the common case).
    Event,
    /// Evaluated on a schedule rather than per event.
    Time,
    /// Fires on a matching event type, gated by mandatory filters.
    Threshold,
}

impl TriggerKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "event" => Some(TriggerKind::Event),
            "time" => Some(TriggerKind::Time),
            "threshold" => Some(TriggerKind::Threshold),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Event => "event",
            TriggerKind::Time => "time",
            TriggerKind::Threshold => "threshold",
        }
    }
}

/// Predicate operator for a single condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    In,
    NotIn,
    Regex,
    Exists,
    NotExists,
}

impl ConditionOperator {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "equals" => Some(ConditionOperator::Equals),
            "not_equals" => Some(ConditionOperator::NotEquals),
            "contains" => Some(ConditionOperator::Contains),
            "not_contains" => Some(ConditionOperator::NotContains),
            "starts_with" => Some(ConditionOperator::StartsWith),
            "ends_with" => Some(ConditionOperator::EndsWith),
            "greater_than" => Some(ConditionOperator::GreaterThan),
            "greater_than_or_equal" => Some(ConditionOperator::GreaterThanOrEqual),
            "less_than" => Some(ConditionOperator::LessThan),
            "less_than_or_equal" => Some(ConditionOperator::LessThanOrEqual),
            "in" => Some(ConditionOperator::In),
            "not_in" => Some(ConditionOperator::NotIn),
            "regex" => Some(ConditionOperator::Regex),
            "exists" => Some(ConditionOperator::Exists),
            "not_exists" => Some(ConditionOperator::NotExists),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "not_equals",
            ConditionOperator::Contains => "contains",
            ConditionOperator::NotContains => "not_contains",
            ConditionOperator::StartsWith => "starts_with",
            ConditionOperator::EndsWith => "ends_with",
            ConditionOperator::GreaterThan => "greater_than",
            ConditionOperator::GreaterThanOrEqual => "greater_than_or_equal",
            ConditionOperator::LessThan => "less_than",
            ConditionOperator::LessThanOrEqual => "less_than_or_equal",
            ConditionOperator::In => "in",
            ConditionOperator::NotIn => "not_in",
            ConditionOperator::Regex => "regex",
            ConditionOperator::Exists => "exists",
            ConditionOperator::NotExists => "not_exists",
        }
    }

    /// Operators that test only field presence and take no value.
    pub fn is_presence_check(&self) -> bool {
        matches!(self, ConditionOperator::Exists | ConditionOperator::NotExists)
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate computed over a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Average,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "count" => Some(AggregateFunction::Count),
            "sum" => Some(AggregateFunction::Sum),
            "average" => Some(AggregateFunction::Average),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Average => "average",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }

    /// Non-count aggregates need a numeric source field.
    pub fn requires_field(&self) -> bool {
        !matches!(self, AggregateFunction::Count)
    }
}

/// Comparison applied to the computed aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOperator {
    Gte,
    Gt,
    Lte,
    Lt,
    Eq,
}

impl ThresholdOperator {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "gte" => Some(ThresholdOperator::Gte),
            "gt" => Some(ThresholdOperator::Gt),
            "lte" => Some(ThresholdOperator::Lte),
            "lt" => Some(ThresholdOperator::Lt),
            "eq" => Some(ThresholdOperator::Eq),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdOperator::Gte => "gte",
            ThresholdOperator::Gt => "gt",
            ThresholdOperator::Lte => "lte",
            ThresholdOperator::Lt => "lt",
            ThresholdOperator::Eq => "eq",
        }
    }

    /// Apply this comparison: `value <op> threshold`.
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            ThresholdOperator::Gte => value >= threshold,
            ThresholdOperator::Gt => value > threshold,
            ThresholdOperator::Lte => value <= threshold,
            ThresholdOperator::Lt => value < threshold,
            ThresholdOperator::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

/// Response action discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Alert,
    Webhook,
    Email,
    Script,
    Log,
    Block,
    Quarantine,
}

impl ActionKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "alert" => Some(ActionKind::Alert),
            "webhook" => Some(ActionKind::Webhook),
            "email" => Some(ActionKind::Email),
            "script" => Some(ActionKind::Script),
            "log" => Some(ActionKind::Log),
            "block" => Some(ActionKind::Block),
            "quarantine" => Some(ActionKind::Quarantine),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Alert => "alert",
            ActionKind::Webhook => "webhook",
            ActionKind::Email => "email",
            ActionKind::Script => "script",
            ActionKind::Log => "log",
            ActionKind::Block => "block",
            ActionKind::Quarantine => "quarantine",
        }
    }
}

/// Backoff shape for action retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

impl BackoffKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(BackoffKind::Fixed),
            "linear" => Some(BackoffKind::Linear),
            "exponential" => Some(BackoffKind::Exponential),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffKind::Fixed => "fixed",
            BackoffKind::Linear => "linear",
            BackoffKind::Exponential => "exponential",
        }
    }
}

// =============================================================================
// Trigger
// =============================================================================

/// Event-type/source filter that makes a rule a candidate for an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Field → expected value filters. Mandatory for threshold triggers.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, ScalarValue>,
}

// =============================================================================
// Condition
// =============================================================================

/// A single field-level predicate within a rule.
///
/// Conditions within a rule combine with logical AND; there is no richer
/// boolean composition in the rule DSL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    /// Dotted path into the event's typed fields or metadata.
    pub field: String,
    pub operator: ConditionOperator,
    /// Required unless the operator is `exists`/`not_exists`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ConditionValue>,
    pub case_sensitive: bool,
    pub negate: bool,
}

impl Condition {
    /// Human-readable `field:operator:value` form, used for alert audit context.
    pub fn describe(&self) -> String {
        match &self.value {
            Some(v) => format!("{}:{}:{}", self.field, self.operator, v),
            None => format!("{}:{}", self.field, self.operator),
        }
    }
}

// =============================================================================
// Aggregation
// =============================================================================

/// Sliding-window aggregate with a threshold condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregation {
    pub function: AggregateFunction,
    /// Numeric source field. Required for sum/average/min/max.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Event fields the window is partitioned by. Non-empty.
    pub group_by: Vec<String>,
    /// Trailing window length in seconds. Must be > 0.
    pub window_seconds: u64,
    pub operator: ThresholdOperator,
    pub threshold: f64,
    /// Optional extra predicate that gates a threshold crossing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub having: Option<Box<Condition>>,
}

// =============================================================================
// Action
// =============================================================================

/// Retry policy attached to an action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_seconds: u64,
    pub backoff: BackoffKind,
}

/// A response action executed when the rule fires.
///
/// Kind-specific requirements (webhook `url`, email `recipients`) live in
/// the `parameters` map and are enforced by the validator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ScalarValue>,
    pub delay_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

// =============================================================================
// Correlation Rule
// =============================================================================

/// A complete correlation rule.
///
/// Immutable once validated: a change is a full reload of the rule set,
/// never an in-place mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationRule {
    /// Unique identifier, `[a-zA-Z0-9_-]+`.
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub severity: Severity,
    /// At least one. No two triggers may share an event type.
    pub triggers: Vec<Trigger>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, ScalarValue>,
}

impl CorrelationRule {
    /// Trigger matching the given event type, if any.
    pub fn trigger_for(&self, event_type: &str) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.event_type == event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_mapping_is_bidirectional() {
        for op in [
            ConditionOperator::Equals,
            ConditionOperator::NotEquals,
            ConditionOperator::Contains,
            ConditionOperator::NotContains,
            ConditionOperator::StartsWith,
            ConditionOperator::EndsWith,
            ConditionOperator::GreaterThan,
            ConditionOperator::GreaterThanOrEqual,
            ConditionOperator::LessThan,
            ConditionOperator::LessThanOrEqual,
            ConditionOperator::In,
            ConditionOperator::NotIn,
            ConditionOperator::Regex,
            ConditionOperator::Exists,
            ConditionOperator::NotExists,
        ] {
            assert_eq!(ConditionOperator::from_str(op.as_str()), Some(op));
        }
    }

    #[test]
    fn unknown_discriminants_rejected() {
        assert_eq!(Severity::from_str("severe"), None);
        assert_eq!(ActionKind::from_str("pager"), None);
        assert_eq!(TriggerKind::from_str("cron"), None);
        assert_eq!(BackoffKind::from_str("jittered"), None);
    }

    #[test]
    fn threshold_compare() {
        assert!(ThresholdOperator::Gte.compare(5.0, 5.0));
        assert!(!ThresholdOperator::Gt.compare(5.0, 5.0));
        assert!(ThresholdOperator::Lt.compare(4.0, 5.0));
        assert!(ThresholdOperator::Eq.compare(5.0, 5.0));
        assert!(!ThresholdOperator::Eq.compare(5.0, 5.1));
    }

    #[test]
    fn condition_describe() {
        let c = Condition {
            field: "source_ip".to_string(),
            operator: ConditionOperator::Equals,
            value: Some(ConditionValue::Scalar(ScalarValue::String(
                "10.0.0.1".to_string(),
            ))),
            case_sensitive: true,
            negate: false,
        };
        assert_eq!(c.describe(), "source_ip:equals:10.0.0.1");

        let e = Condition {
            field: "payload".to_string(),
            operator: ConditionOperator::Exists,
            value: None,
            case_sensitive: true,
            negate: false,
        };
        assert_eq!(e.describe(), "payload:exists");
    }
}
