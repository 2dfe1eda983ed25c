//! The unit carried through the durable queue.
//!
//! Serialized as `{"deviceId": .., "topic": .., "payload": ..}`. The gateway
//! always writes the payload as a string; the consumer accepts any JSON value
//! there and resolves its shape with `TelemetryPayload::from_value`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub device_id: String,
    pub topic: String,
    pub payload: String,
}

impl Envelope {
    pub fn new(device_id: &str, topic: &str, payload: &[u8]) -> Self {
        Self {
            device_id: device_id.to_string(),
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        }
    }
}

/// Consumer-side view of an envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: Value,
}
