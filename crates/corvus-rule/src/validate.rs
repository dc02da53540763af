//! Semantic validation of parsed rules.
//!
//! Validation never stops at the first problem: every violation is collected
//! into one report so a rule author sees the full list at once. An invalid
//! rule is rejected wholesale; there is no partial application.

use std::collections::HashSet;

use crate::model::{ActionKind, Condition, ConditionOperator, CorrelationRule, TriggerKind};
use crate::value::ConditionValue;

/// Aggregated outcome of validating one rule.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

/// Validate a parsed rule, collecting every violation.
pub fn validate(rule: &CorrelationRule) -> ValidationReport {
    let mut report = ValidationReport::default();

    validate_identity(rule, &mut report);
    validate_triggers(rule, &mut report);
    for (i, cond) in rule.conditions.iter().enumerate() {
        validate_condition(cond, &format!("conditions[{i}]"), &mut report);
    }
    validate_aggregation(rule, &mut report);
    validate_actions(rule, &mut report);

    report
}

fn validate_identity(rule: &CorrelationRule, report: &mut ValidationReport) {
    if rule.id.is_empty() {
        report.error("id must not be empty");
    } else if !rule
        .id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        report.error(format!(
            "id '{}' contains characters outside [a-zA-Z0-9_-]",
            rule.id
        ));
    }

    if rule.name.trim().is_empty() {
        report.error("name must not be empty");
    }
}

fn validate_triggers(rule: &CorrelationRule, report: &mut ValidationReport) {
    if rule.triggers.is_empty() {
        report.error("at least one trigger is required");
    }

    let mut seen_types: HashSet<&str> = HashSet::new();
    for (i, trigger) in rule.triggers.iter().enumerate() {
        if trigger.event_type.trim().is_empty() {
            report.error(format!("triggers[{i}]: event_type must not be empty"));
        } else if !seen_types.insert(trigger.event_type.as_str()) {
            report.error(format!(
                "triggers[{i}]: duplicate event_type '{}' within one rule",
                trigger.event_type
            ));
        }

        if trigger.kind == TriggerKind::Threshold && trigger.filters.is_empty() {
            report.error(format!(
                "triggers[{i}]: threshold triggers require non-empty filters"
            ));
        }
    }
}

fn validate_condition(cond: &Condition, path: &str, report: &mut ValidationReport) {
    if cond.field.trim().is_empty() {
        report.error(format!("{path}: field must not be empty"));
    }

    if cond.operator.is_presence_check() {
        return;
    }

    let Some(value) = &cond.value else {
        report.error(format!(
            "{path}: operator '{}' requires a value",
            cond.operator
        ));
        return;
    };

    if cond.operator == ConditionOperator::Regex {
        match value {
            ConditionValue::Scalar(s) => match s.as_str() {
                Some(pattern) => {
                    if let Err(e) = regex::Regex::new(pattern) {
                        report.error(format!("{path}: regex '{pattern}' does not compile: {e}"));
                    }
                }
                None => report.error(format!("{path}: regex value must be a string")),
            },
            ConditionValue::List(_) => {
                report.error(format!("{path}: regex value must be a single string"));
            }
        }
    }
}

fn validate_aggregation(rule: &CorrelationRule, report: &mut ValidationReport) {
    let Some(agg) = &rule.aggregation else {
        return;
    };

    if agg.window_seconds == 0 {
        report.error("aggregation: window_seconds must be greater than zero");
    }
    if agg.group_by.is_empty() {
        report.error("aggregation: group_by must name at least one field");
    } else if agg.group_by.iter().any(|f| f.trim().is_empty()) {
        report.error("aggregation: group_by entries must not be empty");
    }
    if agg.function.requires_field() && agg.field.is_none() {
        report.error(format!(
            "aggregation: function '{}' requires a source field",
            agg.function.as_str()
        ));
    }
    if let Some(having) = &agg.having {
        validate_condition(having, "aggregation.having", report);
    }

    if rule.conditions.is_empty() {
        report.warning("rule has an aggregation but no conditions; every trigger match counts");
    }
}

fn validate_actions(rule: &CorrelationRule, report: &mut ValidationReport) {
    for (i, action) in rule.actions.iter().enumerate() {
        match action.kind {
            ActionKind::Webhook => {
                if !action.parameters.contains_key("url") {
                    report.error(format!("actions[{i}]: webhook requires a 'url' parameter"));
                }
            }
            ActionKind::Email => {
                if !action.parameters.contains_key("recipients") {
                    report.error(format!(
                        "actions[{i}]: email requires a 'recipients' parameter"
                    ));
                }
            }
            ActionKind::Alert
            | ActionKind::Script
            | ActionKind::Log
            | ActionKind::Block
            | ActionKind::Quarantine => {}
        }

        if let Some(retry) = &action.retry_policy
            && retry.attempts == 0
        {
            report.error(format!(
                "actions[{i}]: retry_policy.attempts must be greater than zero"
            ));
        }
    }
}
