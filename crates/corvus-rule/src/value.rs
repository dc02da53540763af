//! Scalar values used in conditions, trigger filters, action parameters,
//! and rule metadata.

use std::fmt;

use serde::Serialize;

/// A scalar value from a rule document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl ScalarValue {
    /// Convert a YAML scalar into a `ScalarValue`. Returns `None` for
    /// mappings, sequences, and nulls.
    pub fn from_yaml(v: &serde_yaml::Value) -> Option<Self> {
        match v {
            serde_yaml::Value::String(s) => Some(ScalarValue::String(s.clone())),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(ScalarValue::Integer(i))
                } else {
                    n.as_f64().map(ScalarValue::Float)
                }
            }
            serde_yaml::Value::Bool(b) => Some(ScalarValue::Bool(*b)),
            _ => None,
        }
    }

    /// Numeric view of this value. Strings parse if they look numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Integer(i) => Some(*i as f64),
            ScalarValue::Float(f) => Some(*f),
            ScalarValue::String(s) => s.parse().ok(),
            ScalarValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::String(s) => f.write_str(s),
            ScalarValue::Integer(i) => write!(f, "{i}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A condition's comparison value: a single scalar, or a list for the
/// set operators (`in`/`not_in`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Scalar(ScalarValue),
    List(Vec<ScalarValue>),
}

impl ConditionValue {
    /// Convert a YAML value; sequences become lists, scalars become scalars.
    pub fn from_yaml(v: &serde_yaml::Value) -> Option<Self> {
        match v {
            serde_yaml::Value::Sequence(seq) => {
                let items: Option<Vec<ScalarValue>> =
                    seq.iter().map(ScalarValue::from_yaml).collect();
                items.map(ConditionValue::List)
            }
            other => ScalarValue::from_yaml(other).map(ConditionValue::Scalar),
        }
    }

    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            ConditionValue::Scalar(s) => Some(s),
            ConditionValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ScalarValue]> {
        match self {
            ConditionValue::List(l) => Some(l),
            ConditionValue::Scalar(_) => None,
        }
    }
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::Scalar(s) => write!(f, "{s}"),
            ConditionValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_from_yaml() {
        let y: serde_yaml::Value = serde_yaml::from_str("hello").unwrap();
        assert_eq!(
            ScalarValue::from_yaml(&y),
            Some(ScalarValue::String("hello".to_string()))
        );

        let y: serde_yaml::Value = serde_yaml::from_str("42").unwrap();
        assert_eq!(ScalarValue::from_yaml(&y), Some(ScalarValue::Integer(42)));

        let y: serde_yaml::Value = serde_yaml::from_str("4.5").unwrap();
        assert_eq!(ScalarValue::from_yaml(&y), Some(ScalarValue::Float(4.5)));

        let y: serde_yaml::Value = serde_yaml::from_str("true").unwrap();
        assert_eq!(ScalarValue::from_yaml(&y), Some(ScalarValue::Bool(true)));

        let y: serde_yaml::Value = serde_yaml::from_str("{a: 1}").unwrap();
        assert_eq!(ScalarValue::from_yaml(&y), None);
    }

    #[test]
    fn numeric_coercion() {
        assert_eq!(ScalarValue::Integer(3).as_f64(), Some(3.0));
        assert_eq!(ScalarValue::String("2.5".to_string()).as_f64(), Some(2.5));
        assert_eq!(ScalarValue::String("abc".to_string()).as_f64(), None);
        assert_eq!(ScalarValue::Bool(true).as_f64(), None);
    }

    #[test]
    fn list_from_yaml() {
        let y: serde_yaml::Value = serde_yaml::from_str("[a, b, 3]").unwrap();
        let v = ConditionValue::from_yaml(&y).unwrap();
        let list = v.as_list().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[2], ScalarValue::Integer(3));
    }

    #[test]
    fn display_forms() {
        assert_eq!(
            ConditionValue::List(vec![
                ScalarValue::String("a".to_string()),
                ScalarValue::Integer(1)
            ])
            .to_string(),
            "[a,1]"
        );
    }
}
