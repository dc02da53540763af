//! Normalized event model with dot-notation field access.
//!
//! Upstream collectors and parsers produce `NormalizedEvent` documents; this
//! core only reads them. Field lookup resolves the typed header fields first
//! (by snake_case or wire-format camelCase name), then falls back to the
//! metadata map, where a flat key takes precedence over dotted traversal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The canonical, source-agnostic event representation consumed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl NormalizedEvent {
    /// Minimal event of the given type with a fresh id and current timestamp.
    pub fn new(event_type: impl Into<String>) -> Self {
        NormalizedEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            severity: None,
            source_ip: None,
            destination_ip: None,
            source_port: None,
            destination_port: None,
            protocol: None,
            device_name: None,
            payload: None,
            metadata: Map::new(),
        }
    }

    /// Look up a field by dotted path.
    ///
    /// Typed header fields resolve by snake_case or camelCase name. Anything
    /// else resolves against the metadata map: flat key first, then an
    /// explicit `metadata.` prefix, then dot-separated traversal.
    pub fn field(&self, path: &str) -> Option<Value> {
        match path {
            "id" => return Some(Value::String(self.id.clone())),
            "timestamp" => return Some(Value::String(self.timestamp.to_rfc3339())),
            "event_type" | "eventType" => return Some(Value::String(self.event_type.clone())),
            "severity" => return self.severity.clone().map(Value::String),
            "source_ip" | "sourceIp" => return self.source_ip.clone().map(Value::String),
            "destination_ip" | "destinationIp" => {
                return self.destination_ip.clone().map(Value::String);
            }
            "source_port" | "sourcePort" => {
                return self.source_port.map(|p| Value::Number(p.into()));
            }
            "destination_port" | "destinationPort" => {
                return self.destination_port.map(|p| Value::Number(p.into()));
            }
            "protocol" => return self.protocol.clone().map(Value::String),
            "device_name" | "deviceName" => return self.device_name.clone().map(Value::String),
            "payload" => return self.payload.clone().map(Value::String),
            _ => {}
        }

        let path = path.strip_prefix("metadata.").unwrap_or(path);

        // Flat key takes precedence over nested traversal.
        if let Some(v) = self.metadata.get(path) {
            return Some(v.clone());
        }
        if path.contains('.') {
            let parts: Vec<&str> = path.split('.').collect();
            let root = Value::Object(self.metadata.clone());
            return traverse(&root, &parts).cloned();
        }
        None
    }

    /// The origin used for trigger source filtering and alert attribution:
    /// device name when present, source IP otherwise.
    pub fn source(&self) -> &str {
        self.device_name
            .as_deref()
            .or(self.source_ip.as_deref())
            .unwrap_or("unknown")
    }

    /// Full JSON snapshot of the event, captured into alert context.
    pub fn snapshot(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Follow dot-separated path segments through nested objects. When a segment
/// resolves to an array, each element is tried and the first match wins.
fn traverse<'a>(current: &'a Value, parts: &[&str]) -> Option<&'a Value> {
    if parts.is_empty() {
        return Some(current);
    }
    let (head, rest) = (parts[0], &parts[1..]);
    match current {
        Value::Object(map) => traverse(map.get(head)?, rest),
        Value::Array(arr) => arr.iter().find_map(|item| traverse(item, parts)),
        _ => None,
    }
}
