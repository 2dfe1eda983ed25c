//! Payload reconstruction for dequeued envelopes.
//!
//! Devices send arbitrary bytes; producers may also put structured JSON in
//! the envelope. The shape is resolved once here:
//!
//! - an object is used as-is
//! - a string is parsed as a JSON object, falling back to `{"raw": <string>}`
//! - anything else is wrapped as `{"value": <original>}`

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryPayload {
    Structured(Map<String, Value>),
    Raw(String),
    Scalar(Value),
}

impl TelemetryPayload {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => TelemetryPayload::Structured(map),
            Value::String(text) => match serde_json::from_str::<Map<String, Value>>(&text) {
                Ok(map) => TelemetryPayload::Structured(map),
                Err(_) => TelemetryPayload::Raw(text),
            },
            other => TelemetryPayload::Scalar(other),
        }
    }

    /// Normalize to the mapping stored downstream.
    pub fn into_map(self) -> Map<String, Value> {
        match self {
            TelemetryPayload::Structured(map) => map,
            TelemetryPayload::Raw(text) => single("raw", Value::String(text)),
            TelemetryPayload::Scalar(value) => single("value", value),
        }
    }
}

fn single(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    map
}
