//! Alert records, lifecycle states, and the factory that folds repeated
//! firings into one alert by dedup key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use corvus_rule::{CorrelationRule, Severity};

use crate::error::Result;
use crate::event::NormalizedEvent;
use crate::repository::AlertRepository;
use crate::window::WindowDecision;

// =============================================================================
// Status
// =============================================================================

/// Lifecycle state of an alert.
///
/// Transitions are recorded but deliberately not restricted: the observed
/// behavior of the system this models imposes no legality checks (an alert
/// can be "un-resolved"), and this implementation preserves that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Investigating,
    Resolved,
    Closed,
    FalsePositive,
}

impl AlertStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "new" => Some(AlertStatus::New),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "investigating" => Some(AlertStatus::Investigating),
            "resolved" => Some(AlertStatus::Resolved),
            "closed" => Some(AlertStatus::Closed),
            "false_positive" => Some(AlertStatus::FalsePositive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::New => "new",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Investigating => "investigating",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Closed => "closed",
            AlertStatus::FalsePositive => "false_positive",
        }
    }

    /// Terminal states stop dedup folding; a new firing with the same dedup
    /// key opens a fresh alert instead.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AlertStatus::Resolved | AlertStatus::Closed | AlertStatus::FalsePositive
        )
    }
}

/// One entry in an alert's append-only status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    pub status: AlertStatus,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
}

// =============================================================================
// Alert record
// =============================================================================

/// A persisted alert. Created by the factory, mutated only through the
/// repository (status changes and dedup increments), never deleted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub triggered_at: DateTime<Utc>,
    pub source: String,
    /// Snapshot of the event that created the alert.
    pub correlation_context: Map<String, Value>,
    /// Human-readable predicate descriptions, in rule order.
    pub matched_conditions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated_value: Option<f64>,
    pub dedup_key: String,
    pub alert_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status_history: Vec<StatusHistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub investigation_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub false_positive_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub false_positive_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlertRecord {
    /// Apply a status change: append a history entry, stamp the per-status
    /// timestamp, and route the comment. Returns `false` (and changes
    /// nothing) when the status is already current.
    ///
    /// History is append-only; existing entries are never rewritten.
    pub fn apply_status(
        &mut self,
        status: AlertStatus,
        actor: &str,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status == status {
            return false;
        }

        self.status = status;
        self.status_history.push(StatusHistoryEntry {
            status,
            timestamp: now,
            actor: actor.to_string(),
        });

        match status {
            AlertStatus::Acknowledged => self.acknowledged_at = Some(now),
            AlertStatus::Investigating => self.investigation_started_at = Some(now),
            AlertStatus::Resolved => {
                self.resolved_at = Some(now);
                if let Some(c) = comment {
                    self.resolution_comment = Some(c.to_string());
                }
            }
            AlertStatus::Closed => self.closed_at = Some(now),
            AlertStatus::FalsePositive => {
                self.false_positive_at = Some(now);
                if let Some(c) = comment {
                    self.false_positive_reason = Some(c.to_string());
                }
            }
            AlertStatus::New => {}
        }

        self.updated_at = now;
        true
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Everything the pipeline knows about one candidate firing.
pub struct RuleFiring<'a> {
    pub rule: &'a CorrelationRule,
    pub event: &'a NormalizedEvent,
    pub matched_conditions: Vec<String>,
    pub decision: Option<WindowDecision>,
}

/// Builds alerts from firings, folding repeats into an existing alert.
///
/// The dedup key is deterministic across redeliveries of the same logical
/// crossing: `rule-id` scoped by the aggregation group key when present,
/// by the event source otherwise. That makes re-firing idempotent at the
/// alert layer under at-least-once delivery.
pub struct AlertFactory {
    repo: Arc<dyn AlertRepository>,
}

impl AlertFactory {
    pub fn new(repo: Arc<dyn AlertRepository>) -> Self {
        AlertFactory { repo }
    }

    /// Create a new alert for this firing, or fold it into the existing
    /// non-terminal alert with the same dedup key.
    ///
    /// Folding bumps `alert_count` and `last_seen` only — no new row and no
    /// status-history entry.
    pub fn create_or_update(&self, firing: &RuleFiring<'_>) -> Result<AlertRecord> {
        let now = firing.event.timestamp;
        let dedup_key = dedup_key(firing);

        if let Some(existing) = self.repo.get_by_dedup_key(&dedup_key)?
            && !existing.status.is_terminal()
        {
            return self.repo.increment_dedup(&existing.id, now);
        }

        let rule = firing.rule;
        let (aggregation_count, aggregated_value) = match &firing.decision {
            Some(d) => (Some(d.count), Some(d.value)),
            None => (None, None),
        };

        let alert = AlertRecord {
            id: Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            status: AlertStatus::New,
            triggered_at: now,
            source: firing.event.source().to_string(),
            correlation_context: firing.event.snapshot(),
            matched_conditions: firing.matched_conditions.clone(),
            aggregation_count,
            aggregated_value,
            dedup_key,
            alert_count: 1,
            first_seen: now,
            last_seen: now,
            status_history: vec![StatusHistoryEntry {
                status: AlertStatus::New,
                timestamp: now,
                actor: "system".to_string(),
            }],
            acknowledged_at: None,
            investigation_started_at: None,
            resolved_at: None,
            closed_at: None,
            false_positive_at: None,
            resolution_comment: None,
            false_positive_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.repo.create(&alert)?;
        Ok(alert)
    }
}

fn dedup_key(firing: &RuleFiring<'_>) -> String {
    match &firing.decision {
        Some(d) => format!("{}:{}", firing.rule.id, d.group_key),
        None => format!("{}:{}", firing.rule.id, firing.event.source()),
    }
}
