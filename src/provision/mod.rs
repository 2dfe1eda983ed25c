//! Administrative seeding of device models and devices.
//!
//! Only the create path exists; it is what `seed` drives from a fixture
//! file so that the gateway has devices to authenticate.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::persistence::{
    ConnectionDetails, Device, DeviceModel, DeviceStatus, SecretManager, TelemetryStore,
};
use crate::schema::SchemaValidator;
use crate::utils::error::ProvisionError;

/// Topic advertised in a device's connection details. The gateway accepts
/// any topic.
pub const DEFAULT_DEVICE_TOPIC: &str = "iot/any";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewModel {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub telemetry_schema: Option<Value>,
    #[serde(default)]
    pub metadata_schema: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDevice {
    #[serde(default)]
    pub id: Option<String>,
    pub model_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Contents of a `seed` fixture file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub models: Vec<NewModel>,
    #[serde(default)]
    pub devices: Vec<NewDevice>,
}

pub struct Provisioner {
    store: Arc<dyn TelemetryStore>,
    secrets: Arc<dyn SecretManager>,
    validator: SchemaValidator,
    mqtt_host: String,
    mqtt_port: u16,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        secrets: Arc<dyn SecretManager>,
        mqtt_host: &str,
        mqtt_port: u16,
    ) -> Self {
        Self {
            store,
            secrets,
            validator: SchemaValidator::new(),
            mqtt_host: mqtt_host.to_string(),
            mqtt_port,
        }
    }

    pub fn register_model(&self, request: NewModel) -> Result<DeviceModel, ProvisionError> {
        for (field, schema) in [
            ("metadata", &request.metadata_schema),
            ("telemetry", &request.telemetry_schema),
        ] {
            if let Some(schema) = schema {
                self.validator
                    .check_schema(schema)
                    .map_err(|source| ProvisionError::InvalidSchema { field, source })?;
            }
        }

        let model = DeviceModel {
            id: request.id.unwrap_or_else(new_id),
            name: request.name,
            description: request.description,
            telemetry_schema: request.telemetry_schema,
            metadata_schema: request.metadata_schema,
            created_at: Utc::now(),
        };
        self.store.save_model(&model)?;
        info!("Registered device model {}", model.id);
        Ok(model)
    }

    /// Create a device, mint its secret and record its connection details.
    /// If the secret cannot be stored the device is removed again.
    pub fn register_device(&self, request: NewDevice) -> Result<Device, ProvisionError> {
        if request.name.is_empty() {
            return Err(ProvisionError::Missing("name"));
        }
        let model = self
            .store
            .get_model(&request.model_id)?
            .ok_or_else(|| ProvisionError::UnknownModel(request.model_id.clone()))?;

        if let Some(schema) = &model.metadata_schema {
            let errors = self
                .validator
                .validate_value(&Value::Object(request.metadata.clone()), schema)
                .map_err(|source| ProvisionError::InvalidSchema {
                    field: "metadata",
                    source,
                })?;
            if !errors.is_empty() {
                return Err(ProvisionError::MetadataRejected(errors));
            }
        }

        let id = request.id.unwrap_or_else(new_id);
        if self.store.get_device(&id)?.is_some() {
            return Err(ProvisionError::DeviceExists(id));
        }

        let mut device = Device {
            id,
            model_id: model.id,
            name: request.name,
            description: request.description,
            connection: None,
            metadata: request.metadata,
            status: DeviceStatus::Active,
            created_at: Utc::now(),
        };
        self.store.save_device(&device)?;

        let secret_path = match self.secrets.generate_and_store(&device.id) {
            Ok(path) => path,
            Err(e) => {
                error!("Error securing device {}: {e}", device.id);
                self.store.delete_device(&device.id)?;
                return Err(e.into());
            }
        };

        device.connection = Some(ConnectionDetails {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            topic: DEFAULT_DEVICE_TOPIC.to_string(),
            username: device.id.clone(),
            secret_path,
        });
        self.store.save_device(&device)?;
        info!("Registered device {} of model {}", device.id, device.model_id);
        Ok(device)
    }

    /// Register every model, then every device, of a fixture.
    pub fn seed(&self, seed: SeedFile) -> Result<(Vec<DeviceModel>, Vec<Device>), ProvisionError> {
        let models = seed
            .models
            .into_iter()
            .map(|m| self.register_model(m))
            .collect::<Result<Vec<_>, _>>()?;
        let devices = seed
            .devices
            .into_iter()
            .map(|d| self.register_device(d))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((models, devices))
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests;
