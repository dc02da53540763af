use thiserror::Error;

/// Errors produced while parsing rule documents.
///
/// Parse errors are scoped to a single rule document; directory loading
/// collects them per file instead of aborting the batch.
#[derive(Debug, Error)]
pub enum RuleParseError {
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("rule document is not a YAML mapping")]
    NotAMapping,

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no rules loaded ({attempted} file(s) examined)")]
    NoRulesLoaded { attempted: usize },
}

impl RuleParseError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        RuleParseError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuleParseError>;
