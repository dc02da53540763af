//! Engine-side error types.
//!
//! Transient failures against the window store or the alert repository are
//! marked retryable; the pipeline retries them with backoff and, on
//! exhaustion, surfaces the error so the consumer does not commit the
//! message (forcing redelivery). Everything else is scoped to a single rule
//! and handled by skipping that rule.

use thiserror::Error;

/// Errors that can occur during rule compilation or event evaluation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A rule document failed to parse during a reload.
    #[error("rule error: {0}")]
    Rule(#[from] corvus_rule::RuleParseError),

    /// A regex pattern failed to compile at rule-compilation time.
    #[error("invalid regex pattern: {0}")]
    InvalidRegex(#[from] regex::Error),

    /// A rule is structurally unusable for evaluation (should have been
    /// caught by validation).
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// Transient failure talking to the aggregation window store.
    #[error("window store error: {0}")]
    Store(String),

    /// Transient failure persisting or reading alerts.
    #[error("alert persistence error: {0}")]
    Persistence(String),

    /// The referenced alert does not exist. Distinct from malformed input.
    #[error("no such alert: {0}")]
    AlertNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the pipeline should retry this failure with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::Persistence(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, EngineError>;
