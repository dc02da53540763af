//! Compiled condition predicates for hot-path evaluation.
//!
//! Each rule's conditions are compiled once at load time: regex patterns are
//! built (with a size cap), case-insensitive needles pre-lowered. Evaluation
//! against an event allocates nothing beyond the field lookup.
//!
//! Semantics:
//! - String operators coerce numbers and booleans to their string form and
//!   match any element when the field is an array.
//! - Numeric operators coerce both sides to `f64` and fail closed (return
//!   `false`) on non-numeric input rather than erroring.
//! - A missing field makes every operator except `exists`/`not_exists`
//!   evaluate to `false`; `negate` inverts whatever the operator produced.
//! - The `regex` crate guarantees linear-time matching, so a hostile event
//!   cannot stall the worker on a backtracking pattern; `REGEX_SIZE_LIMIT`
//!   caps compiled-pattern size at load time.

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use corvus_rule::{Condition, ConditionOperator, ScalarValue};

use crate::error::{EngineError, Result};
use crate::event::NormalizedEvent;

/// Compiled-pattern size cap, in bytes.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// A condition compiled for repeated evaluation.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    field: String,
    negate: bool,
    matcher: Matcher,
    description: String,
}

#[derive(Debug, Clone)]
enum Matcher {
    Equals {
        expected: ScalarValue,
        case_insensitive: bool,
        negated: bool,
    },
    Substring {
        kind: SubstringKind,
        needle: String,
        case_insensitive: bool,
        negated: bool,
    },
    Numeric {
        cmp: NumericCmp,
        rhs: f64,
    },
    InSet {
        values: Vec<ScalarValue>,
        case_insensitive: bool,
        negated: bool,
    },
    Regex(Regex),
    Exists(bool),
}

#[derive(Debug, Clone, Copy)]
enum SubstringKind {
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Copy)]
enum NumericCmp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompiledCondition {
    /// Compile a parsed condition. Fails on a regex that does not compile or
    /// a value/operator mismatch the validator would have rejected.
    pub fn compile(cond: &Condition) -> Result<Self> {
        let matcher = build_matcher(cond)?;
        Ok(CompiledCondition {
            field: cond.field.clone(),
            negate: cond.negate,
            matcher,
            description: cond.describe(),
        })
    }

    /// The `field:operator:value` form recorded in alert context.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Evaluate this condition against an event.
    pub fn evaluate(&self, event: &NormalizedEvent) -> bool {
        let value = event.field(&self.field);

        let outcome = match (&self.matcher, &value) {
            (Matcher::Exists(expect), v) => v.is_some() == *expect,
            (_, None) => false,
            (matcher, Some(v)) => matcher.matches(v),
        };

        outcome != self.negate
    }
}

impl Matcher {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Matcher::Equals {
                expected,
                case_insensitive,
                negated,
            } => {
                let eq = scalar_matches(value, expected, *case_insensitive);
                eq != *negated
            }

            Matcher::Substring {
                kind,
                needle,
                case_insensitive,
                negated,
            } => {
                let hit = match_str_value(value, |s| {
                    let haystack = if *case_insensitive {
                        s.to_ascii_lowercase()
                    } else {
                        s.to_string()
                    };
                    match kind {
                        SubstringKind::Contains => haystack.contains(needle.as_str()),
                        SubstringKind::StartsWith => haystack.starts_with(needle.as_str()),
                        SubstringKind::EndsWith => haystack.ends_with(needle.as_str()),
                    }
                });
                hit != *negated
            }

            Matcher::Numeric { cmp, rhs } => match_numeric_value(value, |v| match cmp {
                NumericCmp::Gt => v > *rhs,
                NumericCmp::Gte => v >= *rhs,
                NumericCmp::Lt => v < *rhs,
                NumericCmp::Lte => v <= *rhs,
            }),

            Matcher::InSet {
                values,
                case_insensitive,
                negated,
            } => {
                let hit = values
                    .iter()
                    .any(|expected| scalar_matches(value, expected, *case_insensitive));
                hit != *negated
            }

            Matcher::Regex(re) => match_str_value(value, |s| re.is_match(s)),

            Matcher::Exists(_) => unreachable!("presence checks handled before field lookup"),
        }
    }
}

fn build_matcher(cond: &Condition) -> Result<Matcher> {
    use ConditionOperator::*;

    if cond.operator.is_presence_check() {
        return Ok(Matcher::Exists(cond.operator == Exists));
    }

    let value = cond.value.as_ref().ok_or_else(|| {
        EngineError::InvalidRule(format!(
            "condition on '{}': operator '{}' requires a value",
            cond.field, cond.operator
        ))
    })?;

    let ci = !cond.case_sensitive;
    let field = cond.field.as_str();

    Ok(match cond.operator {
        Equals | NotEquals => Matcher::Equals {
            expected: want_scalar(value, field, "equality")?.clone(),
            case_insensitive: ci,
            negated: cond.operator == NotEquals,
        },
        Contains | NotContains => Matcher::Substring {
            kind: SubstringKind::Contains,
            needle: want_needle(value, field, "contains", ci)?,
            case_insensitive: ci,
            negated: cond.operator == NotContains,
        },
        StartsWith => Matcher::Substring {
            kind: SubstringKind::StartsWith,
            needle: want_needle(value, field, "starts_with", ci)?,
            case_insensitive: ci,
            negated: false,
        },
        EndsWith => Matcher::Substring {
            kind: SubstringKind::EndsWith,
            needle: want_needle(value, field, "ends_with", ci)?,
            case_insensitive: ci,
            negated: false,
        },
        GreaterThan => Matcher::Numeric {
            cmp: NumericCmp::Gt,
            rhs: want_numeric(value, field, "greater_than")?,
        },
        GreaterThanOrEqual => Matcher::Numeric {
            cmp: NumericCmp::Gte,
            rhs: want_numeric(value, field, "greater_than_or_equal")?,
        },
        LessThan => Matcher::Numeric {
            cmp: NumericCmp::Lt,
            rhs: want_numeric(value, field, "less_than")?,
        },
        LessThanOrEqual => Matcher::Numeric {
            cmp: NumericCmp::Lte,
            rhs: want_numeric(value, field, "less_than_or_equal")?,
        },
        In | NotIn => {
            // A bare scalar is treated as a single-element set.
            let values = match value.as_list() {
                Some(list) => list.to_vec(),
                None => vec![want_scalar(value, field, "in")?.clone()],
            };
            Matcher::InSet {
                values,
                case_insensitive: ci,
                negated: cond.operator == NotIn,
            }
        }
        Regex => {
            let pattern = want_scalar(value, field, "regex")?.as_str().ok_or_else(|| {
                EngineError::InvalidRule(format!(
                    "condition on '{field}': regex requires a string pattern"
                ))
            })?;
            let re = RegexBuilder::new(pattern)
                .case_insensitive(ci)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()?;
            Matcher::Regex(re)
        }
        Exists | NotExists => unreachable!("handled above"),
    })
}

fn want_scalar<'a>(
    value: &'a corvus_rule::ConditionValue,
    field: &str,
    what: &str,
) -> Result<&'a ScalarValue> {
    value.as_scalar().ok_or_else(|| {
        EngineError::InvalidRule(format!(
            "condition on '{field}': {what} requires a scalar value"
        ))
    })
}

fn want_needle(
    value: &corvus_rule::ConditionValue,
    field: &str,
    what: &str,
    case_insensitive: bool,
) -> Result<String> {
    let s = want_scalar(value, field, what)?.to_string();
    Ok(if case_insensitive {
        s.to_ascii_lowercase()
    } else {
        s
    })
}

fn want_numeric(value: &corvus_rule::ConditionValue, field: &str, what: &str) -> Result<f64> {
    want_scalar(value, field, what)?.as_f64().ok_or_else(|| {
        EngineError::InvalidRule(format!(
            "condition on '{field}': {what} requires a numeric value"
        ))
    })
}

// ---------------------------------------------------------------------------
// Value coercion helpers
// ---------------------------------------------------------------------------

/// Compare an event value against an expected scalar, coercing numerics.
/// Arrays match when any element matches.
pub(crate) fn scalar_matches(value: &Value, expected: &ScalarValue, case_insensitive: bool) -> bool {
    match value {
        Value::Array(arr) => arr
            .iter()
            .any(|v| scalar_matches(v, expected, case_insensitive)),
        Value::String(s) => match expected {
            ScalarValue::String(e) => {
                if case_insensitive {
                    s.eq_ignore_ascii_case(e)
                } else {
                    s == e
                }
            }
            // "5" equals 5 — coerce the string side when the rule side is numeric
            ScalarValue::Integer(_) | ScalarValue::Float(_) => s
                .parse::<f64>()
                .ok()
                .zip(expected.as_f64())
                .is_some_and(|(a, b)| (a - b).abs() < f64::EPSILON),
            ScalarValue::Bool(_) => false,
        },
        Value::Number(n) => match expected.as_f64() {
            Some(e) => n.as_f64().is_some_and(|v| (v - e).abs() < f64::EPSILON),
            None => false,
        },
        Value::Bool(b) => matches!(expected, ScalarValue::Bool(e) if e == b),
        _ => false,
    }
}

/// String view of an event value: strings directly, numbers and booleans
/// coerced, arrays element-wise.
fn match_str_value(value: &Value, pred: impl Fn(&str) -> bool) -> bool {
    match_str_value_ref(value, &pred)
}

fn match_str_value_ref(value: &Value, pred: &dyn Fn(&str) -> bool) -> bool {
    match value {
        Value::String(s) => pred(s),
        Value::Number(n) => pred(&n.to_string()),
        Value::Bool(b) => pred(if *b { "true" } else { "false" }),
        Value::Array(arr) => arr.iter().any(|v| match_str_value_ref(v, pred)),
        _ => false,
    }
}

/// Numeric view of an event value; strings parse, everything else fails closed.
fn match_numeric_value(value: &Value, pred: impl Fn(f64) -> bool) -> bool {
    match_numeric_value_ref(value, &pred)
}

fn match_numeric_value_ref(value: &Value, pred: &dyn Fn(f64) -> bool) -> bool {
    match value {
        Value::Number(n) => n.as_f64().is_some_and(pred),
        Value::String(s) => s.parse::<f64>().is_ok_and(pred),
        Value::Array(arr) => arr.iter().any(|v| match_numeric_value_ref(v, pred)),
        _ => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
