//! YAML → rule model parser and directory loader.
//!
//! Parsing is two-phase: the document is first deserialized into a generic
//! `serde_yaml::Value` (rejecting malformed text), then extracted field by
//! field with named errors for anything missing or mistyped. Semantic checks
//! beyond shape live in [`crate::validate`].

use std::collections::BTreeMap;
use std::path::Path;

use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::error::{Result, RuleParseError};
use crate::model::*;
use crate::validate::validate;
use crate::value::{ConditionValue, ScalarValue};

// =============================================================================
// Public API
// =============================================================================

/// Parse a single rule document from YAML text.
pub fn parse_rule_str(text: &str) -> Result<CorrelationRule> {
    let value: Value = serde_yaml::from_str(text)?;
    let m = value.as_mapping().ok_or(RuleParseError::NotAMapping)?;
    parse_rule_mapping(m)
}

/// Parse a single rule file from a path.
pub fn parse_rule_file(path: &Path) -> Result<CorrelationRule> {
    let content = std::fs::read_to_string(path)?;
    parse_rule_str(&content)
}

/// Serialize a rule back to YAML text.
///
/// Round-trip contract: `parse_rule_str(serialize_rule(&r)?)` yields a rule
/// equal to `r`.
pub fn serialize_rule(rule: &CorrelationRule) -> Result<String> {
    Ok(serde_yaml::to_string(rule)?)
}

/// One file's failure while loading a directory.
#[derive(Debug, Clone)]
pub struct RuleFileError {
    pub file: String,
    pub message: String,
}

/// Result of loading a rules directory.
///
/// Per-file failures never abort the batch; they are collected here.
#[derive(Debug, Default)]
pub struct RuleLoadOutcome {
    pub rules: Vec<CorrelationRule>,
    pub errors: Vec<RuleFileError>,
    pub warnings: Vec<String>,
}

/// Load every `.yml`/`.yaml` rule file under `dir` (recursively).
///
/// Each file is parsed and validated independently. A file that fails to
/// parse, or whose rule fails validation, contributes a named error and is
/// skipped. The batch as a whole fails only when zero rules load. A mismatch
/// between the file stem and the rule id is logged but tolerated.
pub fn load_rule_directory(dir: &Path) -> Result<RuleLoadOutcome> {
    let mut outcome = RuleLoadOutcome::default();
    let mut attempted = 0usize;

    walk(dir, &mut outcome, &mut attempted)?;

    if outcome.rules.is_empty() {
        return Err(RuleParseError::NoRulesLoaded { attempted });
    }
    Ok(outcome)
}

fn walk(dir: &Path, outcome: &mut RuleLoadOutcome, attempted: &mut usize) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, outcome, attempted)?;
            continue;
        }
        if !matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml" | "yaml")
        ) {
            continue;
        }

        *attempted += 1;
        let display = path.display().to_string();

        let rule = match parse_rule_file(&path) {
            Ok(rule) => rule,
            Err(e) => {
                outcome.errors.push(RuleFileError {
                    file: display,
                    message: e.to_string(),
                });
                continue;
            }
        };

        let report = validate(&rule);
        if !report.is_valid() {
            outcome.errors.push(RuleFileError {
                file: display,
                message: report.errors.join("; "),
            });
            continue;
        }
        for w in report.warnings {
            outcome.warnings.push(format!("{display}: {w}"));
        }

        if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            && stem != rule.id
        {
            warn!(file = %display, rule_id = %rule.id, "rule file name does not match rule id");
        }

        outcome.rules.push(rule);
    }
    Ok(())
}

// =============================================================================
// Mapping extraction helpers
// =============================================================================

fn get<'a>(m: &'a Mapping, key: &str) -> Option<&'a Value> {
    m.get(key)
}

fn get_str<'a>(m: &'a Mapping, key: &str) -> Option<&'a str> {
    get(m, key).and_then(Value::as_str)
}

fn require_str<'a>(m: &'a Mapping, key: &str) -> Result<&'a str> {
    require_str_at(m, key, key)
}

/// Like [`require_str`], reporting errors under a qualified path such as
/// `triggers[0].event_type`.
fn require_str_at<'a>(m: &'a Mapping, key: &str, path: &str) -> Result<&'a str> {
    match get(m, key) {
        None => Err(RuleParseError::MissingField(path.to_string())),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(RuleParseError::invalid(path, "expected a string")),
    }
}

fn get_bool(m: &Mapping, key: &str, default: bool) -> Result<bool> {
    match get(m, key) {
        None => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(RuleParseError::invalid(key, "expected a boolean")),
    }
}

fn require_u64_at(m: &Mapping, key: &str, path: &str) -> Result<u64> {
    match get(m, key) {
        None => Err(RuleParseError::MissingField(path.to_string())),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| RuleParseError::invalid(path, "expected a non-negative integer")),
        Some(_) => Err(RuleParseError::invalid(path, "expected an integer")),
    }
}

fn get_u64(m: &Mapping, key: &str, default: u64) -> Result<u64> {
    match get(m, key) {
        None => Ok(default),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| RuleParseError::invalid(key, "expected a non-negative integer")),
        Some(_) => Err(RuleParseError::invalid(key, "expected an integer")),
    }
}

fn require_f64_at(m: &Mapping, key: &str, path: &str) -> Result<f64> {
    match get(m, key) {
        None => Err(RuleParseError::MissingField(path.to_string())),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| RuleParseError::invalid(path, "expected a number")),
        Some(_) => Err(RuleParseError::invalid(path, "expected a number")),
    }
}

/// Extract a map of string keys to scalar values (filters, parameters, metadata).
fn scalar_map(m: &Mapping, key: &str) -> Result<BTreeMap<String, ScalarValue>> {
    let mut out = BTreeMap::new();
    let Some(v) = get(m, key) else {
        return Ok(out);
    };
    let mapping = v
        .as_mapping()
        .ok_or_else(|| RuleParseError::invalid(key, "expected a mapping"))?;
    for (k, v) in mapping {
        let k = k
            .as_str()
            .ok_or_else(|| RuleParseError::invalid(key, "keys must be strings"))?;
        let scalar = ScalarValue::from_yaml(v).ok_or_else(|| {
            RuleParseError::invalid(key, format!("value for '{k}' must be a scalar"))
        })?;
        out.insert(k.to_string(), scalar);
    }
    Ok(out)
}

// =============================================================================
// Rule parsing
// =============================================================================

fn parse_rule_mapping(m: &Mapping) -> Result<CorrelationRule> {
    let id = require_str(m, "id")?.to_string();
    let name = require_str(m, "name")?.to_string();
    let description = get_str(m, "description").map(str::to_string);
    let enabled = get_bool(m, "enabled", true)?;

    let severity_str = require_str(m, "severity")?;
    let severity = Severity::from_str(severity_str)
        .ok_or_else(|| RuleParseError::invalid("severity", format!("unknown severity '{severity_str}'")))?;

    let triggers_val = get(m, "triggers").ok_or_else(|| RuleParseError::MissingField("triggers".to_string()))?;
    let triggers_seq = triggers_val
        .as_sequence()
        .ok_or_else(|| RuleParseError::invalid("triggers", "expected a sequence"))?;
    let mut triggers = Vec::with_capacity(triggers_seq.len());
    for (i, t) in triggers_seq.iter().enumerate() {
        triggers.push(parse_trigger(t, i)?);
    }

    let mut conditions = Vec::new();
    if let Some(v) = get(m, "conditions") {
        let seq = v
            .as_sequence()
            .ok_or_else(|| RuleParseError::invalid("conditions", "expected a sequence"))?;
        for (i, c) in seq.iter().enumerate() {
            conditions.push(parse_condition(c, &format!("conditions[{i}]"))?);
        }
    }

    let aggregation = match get(m, "aggregation") {
        None | Some(Value::Null) => None,
        Some(v) => Some(parse_aggregation(v)?),
    };

    let mut actions = Vec::new();
    if let Some(v) = get(m, "actions") {
        let seq = v
            .as_sequence()
            .ok_or_else(|| RuleParseError::invalid("actions", "expected a sequence"))?;
        for (i, a) in seq.iter().enumerate() {
            actions.push(parse_action(a, i)?);
        }
    }

    let metadata = scalar_map(m, "metadata")?;

    Ok(CorrelationRule {
        id,
        name,
        description,
        enabled,
        severity,
        triggers,
        conditions,
        aggregation,
        actions,
        metadata,
    })
}

fn parse_trigger(v: &Value, index: usize) -> Result<Trigger> {
    let field = format!("triggers[{index}]");
    let m = v
        .as_mapping()
        .ok_or_else(|| RuleParseError::invalid(&field, "expected a mapping"))?;

    let kind_str = require_str_at(m, "type", &format!("{field}.type"))?;
    let kind = TriggerKind::from_str(kind_str).ok_or_else(|| {
        RuleParseError::invalid(&field, format!("unknown trigger type '{kind_str}'"))
    })?;

    let event_type = require_str_at(m, "event_type", &format!("{field}.event_type"))?.to_string();

    let source = get_str(m, "source").map(str::to_string);
    let filters = scalar_map(m, "filters")?;

    Ok(Trigger {
        kind,
        event_type,
        source,
        filters,
    })
}

fn parse_condition(v: &Value, field_path: &str) -> Result<Condition> {
    let m = v
        .as_mapping()
        .ok_or_else(|| RuleParseError::invalid(field_path, "expected a mapping"))?;

    let field = require_str_at(m, "field", &format!("{field_path}.field"))?.to_string();

    let op_str = require_str_at(m, "operator", &format!("{field_path}.operator"))?;
    let operator = ConditionOperator::from_str(op_str).ok_or_else(|| {
        RuleParseError::invalid(field_path, format!("unknown operator '{op_str}'"))
    })?;

    let value = match get(m, "value") {
        None | Some(Value::Null) => None,
        Some(v) => Some(ConditionValue::from_yaml(v).ok_or_else(|| {
            RuleParseError::invalid(field_path, "value must be a scalar or a list of scalars")
        })?),
    };

    Ok(Condition {
        field,
        operator,
        value,
        case_sensitive: get_bool(m, "case_sensitive", true)?,
        negate: get_bool(m, "negate", false)?,
    })
}

fn parse_aggregation(v: &Value) -> Result<Aggregation> {
    let m = v
        .as_mapping()
        .ok_or_else(|| RuleParseError::invalid("aggregation", "expected a mapping"))?;

    let fn_str = require_str_at(m, "function", "aggregation.function")?;
    let function = AggregateFunction::from_str(fn_str).ok_or_else(|| {
        RuleParseError::invalid("aggregation.function", format!("unknown function '{fn_str}'"))
    })?;

    let field = get_str(m, "field").map(str::to_string);

    // group_by accepts a single field name or a list of them
    let group_by = match get(m, "group_by") {
        None => Vec::new(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Sequence(seq)) => {
            let mut out = Vec::with_capacity(seq.len());
            for item in seq {
                let s = item.as_str().ok_or_else(|| {
                    RuleParseError::invalid("aggregation.group_by", "entries must be strings")
                })?;
                out.push(s.to_string());
            }
            out
        }
        Some(_) => {
            return Err(RuleParseError::invalid(
                "aggregation.group_by",
                "expected a string or list of strings",
            ));
        }
    };

    let window_seconds = require_u64_at(m, "window_seconds", "aggregation.window_seconds")?;

    let op_str = require_str_at(m, "operator", "aggregation.operator")?;
    let operator = ThresholdOperator::from_str(op_str).ok_or_else(|| {
        RuleParseError::invalid("aggregation.operator", format!("unknown operator '{op_str}'"))
    })?;

    let threshold = require_f64_at(m, "threshold", "aggregation.threshold")?;

    let having = match get(m, "having") {
        None | Some(Value::Null) => None,
        Some(v) => Some(Box::new(parse_condition(v, "aggregation.having")?)),
    };

    Ok(Aggregation {
        function,
        field,
        group_by,
        window_seconds,
        operator,
        threshold,
        having,
    })
}

fn parse_action(v: &Value, index: usize) -> Result<Action> {
    let field = format!("actions[{index}]");
    let m = v
        .as_mapping()
        .ok_or_else(|| RuleParseError::invalid(&field, "expected a mapping"))?;

    let kind_str = require_str_at(m, "type", &format!("{field}.type"))?;
    let kind = ActionKind::from_str(kind_str).ok_or_else(|| {
        RuleParseError::invalid(&field, format!("unknown action type '{kind_str}'"))
    })?;

    let parameters = scalar_map(m, "parameters")?;
    let delay_seconds = get_u64(m, "delay_seconds", 0)?;

    let retry_policy = match get(m, "retry_policy") {
        None | Some(Value::Null) => None,
        Some(v) => {
            let rm = v
                .as_mapping()
                .ok_or_else(|| RuleParseError::invalid("retry_policy", "expected a mapping"))?;
            let attempts =
                require_u64_at(rm, "attempts", &format!("{field}.retry_policy.attempts"))?;
            let attempts = u32::try_from(attempts).map_err(|_| {
                RuleParseError::invalid("retry_policy.attempts", "value out of range")
            })?;
            let delay_seconds = get_u64(rm, "delay_seconds", 0)?;
            let backoff_str = get_str(rm, "backoff").unwrap_or("fixed");
            let backoff = BackoffKind::from_str(backoff_str).ok_or_else(|| {
                RuleParseError::invalid(
                    "retry_policy.backoff",
                    format!("unknown backoff '{backoff_str}'"),
                )
            })?;
            Some(RetryPolicy {
                attempts,
                delay_seconds,
                backoff,
            })
        }
    };

    Ok(Action {
        kind,
        parameters,
        delay_seconds,
        retry_policy,
    })
}

// =============================================================================
// Tests
// =============================================================================
