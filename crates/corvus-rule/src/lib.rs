//! # corvus-rule
//!
//! The correlation rule DSL: model, parser, and validator.
//!
//! A rule is one YAML document describing what to watch for (triggers),
//! which predicates must hold (conditions), an optional sliding-window
//! aggregate (aggregation), and what to do on a firing (actions).
//!
//! Parsing is two-phase: syntactic YAML deserialization into a generic
//! document, then field-by-field extraction with named errors. Semantic
//! checks (id charset, trigger/condition/aggregation/action consistency,
//! regex compilation) run separately and aggregate every violation into one
//! [`ValidationReport`].
//!
//! ## Quick Start
//!
//! ```rust
//! use corvus_rule::{parse_rule_str, validate};
//!
//! let yaml = r#"
//! id: ssh-bruteforce
//! name: SSH brute force
//! severity: high
//! triggers:
//!   - type: event
//!     event_type: login_failure
//! aggregation:
//!   function: count
//!   group_by: source_ip
//!   window_seconds: 300
//!   operator: gte
//!   threshold: 5
//! "#;
//!
//! let rule = parse_rule_str(yaml).unwrap();
//! assert!(validate(&rule).is_valid());
//! assert_eq!(rule.triggers[0].event_type, "login_failure");
//! ```

pub mod error;
pub mod model;
pub mod parser;
pub mod validate;
pub mod value;

pub use error::{Result, RuleParseError};
pub use model::{
    Action, ActionKind, AggregateFunction, Aggregation, BackoffKind, Condition,
    ConditionOperator, CorrelationRule, RetryPolicy, Severity, ThresholdOperator, Trigger,
    TriggerKind,
};
pub use parser::{
    RuleFileError, RuleLoadOutcome, load_rule_directory, parse_rule_file, parse_rule_str,
    serialize_rule,
};
pub use validate::{ValidationReport, validate};
pub use value::{ConditionValue, ScalarValue};
