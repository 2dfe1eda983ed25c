//! Documents held by the telemetry store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Active,
    Inactive,
}

/// Where and how a device connects to the gateway.
///
/// `username` is the device id and `secret_path` doubles as the MQTT
/// password.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionDetails {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub username: String,
    pub secret_path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Device {
    pub id: String,
    pub model_id: String,
    pub name: String,
    pub description: Option<String>,
    pub connection: Option<ConnectionDetails>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
}

/// A class of devices; schemas are optional and `None` accepts anything.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceModel {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub telemetry_schema: Option<Value>,
    pub metadata_schema: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// One accepted telemetry message. Never updated after insert.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub id: String,
    pub device_id: String,
    pub model_id: String,
    pub telemetry_payload: Map<String, Value>,
    pub received_at: DateTime<Utc>,
}
