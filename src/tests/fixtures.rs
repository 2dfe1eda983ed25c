//! Shared test fixtures: device `d1` of model `m1` whose telemetry schema
//! requires a numeric `temp`.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::persistence::{
    ConnectionDetails, Device, DeviceModel, DeviceStatus, SledStore, TelemetryStore,
};

pub const DEVICE_ID: &str = "d1";
pub const MODEL_ID: &str = "m1";
pub const SECRET_PATH: &str = "secret/d1";

pub fn temp_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": { "temp": { "type": "number" } },
        "required": ["temp"]
    })
}

pub fn model(id: &str, telemetry_schema: Option<Value>) -> DeviceModel {
    DeviceModel {
        id: id.to_string(),
        name: format!("model {id}"),
        description: None,
        telemetry_schema,
        metadata_schema: None,
        created_at: Utc::now(),
    }
}

pub fn device(id: &str, model_id: &str, secret_path: &str) -> Device {
    Device {
        id: id.to_string(),
        model_id: model_id.to_string(),
        name: format!("device {id}"),
        description: None,
        connection: Some(ConnectionDetails {
            host: "127.0.0.1".to_string(),
            port: 1883,
            topic: "iot/any".to_string(),
            username: id.to_string(),
            secret_path: secret_path.to_string(),
        }),
        metadata: Map::new(),
        status: DeviceStatus::Active,
        created_at: Utc::now(),
    }
}

/// Temporary store holding `d1` / `m1`.
pub fn seeded_store() -> Arc<SledStore> {
    let store = SledStore::temporary().expect("temporary store");
    store
        .save_model(&model(MODEL_ID, Some(temp_schema())))
        .expect("save model");
    store
        .save_device(&device(DEVICE_ID, MODEL_ID, SECRET_PATH))
        .expect("save device");
    Arc::new(store)
}

pub fn map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}
