use super::*;
use crate::persistence::{CredentialStore, SledSecretStore, SledStore};
use crate::tests::fixtures::temp_schema;
use crate::utils::error::StoreError;
use serde_json::json;

struct FailingSecrets;

impl SecretManager for FailingSecrets {
    fn generate_and_store(&self, _: &str) -> Result<String, StoreError> {
        Err(StoreError::Sled(sled::Error::Unsupported("vault offline".into())))
    }

    fn store(&self, _: &str, _: &str) -> Result<String, StoreError> {
        Err(StoreError::Sled(sled::Error::Unsupported("vault offline".into())))
    }

    fn read(&self, _: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }
}

fn provisioner() -> (Provisioner, Arc<SledStore>, Arc<SledSecretStore>) {
    let store = Arc::new(SledStore::temporary().unwrap());
    let secrets = Arc::new(SledSecretStore::open(store.db()).unwrap());
    (
        Provisioner::new(store.clone(), secrets.clone(), "127.0.0.1", 1883),
        store,
        secrets,
    )
}

fn new_model(id: &str) -> NewModel {
    NewModel {
        id: Some(id.to_string()),
        name: "thermometer".to_string(),
        description: None,
        telemetry_schema: Some(temp_schema()),
        metadata_schema: Some(json!({
            "type": "object",
            "properties": { "site": { "type": "string" } },
            "required": ["site"]
        })),
    }
}

fn new_device(model_id: &str, metadata: serde_json::Value) -> NewDevice {
    serde_json::from_value(json!({
        "modelId": model_id,
        "name": "probe",
        "metadata": metadata
    }))
    .unwrap()
}

#[test]
fn test_register_model_persists() {
    let (provisioner, store, _) = provisioner();
    let model = provisioner.register_model(new_model("m1")).unwrap();
    assert_eq!(store.get_model("m1").unwrap(), Some(model));
}

#[test]
fn test_register_model_rejects_broken_schema() {
    let (provisioner, store, _) = provisioner();
    let mut request = new_model("m1");
    request.telemetry_schema = Some(json!({ "type": "not_a_valid_type" }));

    let err = provisioner.register_model(request).unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::InvalidSchema {
            field: "telemetry",
            ..
        }
    ));
    assert!(store.get_model("m1").unwrap().is_none());
}

#[test]
fn test_register_device_mints_credentials() {
    let (provisioner, store, secrets) = provisioner();
    provisioner.register_model(new_model("m1")).unwrap();

    let device = provisioner
        .register_device(new_device("m1", json!({ "site": "roof" })))
        .unwrap();
    let connection = device.connection.clone().unwrap();
    assert_eq!(connection.username, device.id);
    assert_eq!(connection.topic, DEFAULT_DEVICE_TOPIC);
    assert_eq!(connection.secret_path, format!("secret/{}", device.id));
    assert!(secrets.read(&connection.secret_path).unwrap().is_some());

    let found = store
        .find_by_credentials(&device.id, &connection.secret_path)
        .unwrap();
    assert_eq!(found, Some(device));
}

#[test]
fn test_register_device_requires_known_model() {
    let (provisioner, _, _) = provisioner();
    let err = provisioner
        .register_device(new_device("missing", json!({})))
        .unwrap_err();
    assert!(matches!(err, ProvisionError::UnknownModel(id) if id == "missing"));
}

#[test]
fn test_register_device_requires_name() {
    let (provisioner, _, _) = provisioner();
    provisioner.register_model(new_model("m1")).unwrap();
    let mut request = new_device("m1", json!({ "site": "roof" }));
    request.name.clear();
    assert!(matches!(
        provisioner.register_device(request),
        Err(ProvisionError::Missing("name"))
    ));
}

#[test]
fn test_register_device_validates_metadata() {
    let (provisioner, _, _) = provisioner();
    provisioner.register_model(new_model("m1")).unwrap();
    let err = provisioner
        .register_device(new_device("m1", json!({ "site": 3 })))
        .unwrap_err();
    assert!(matches!(err, ProvisionError::MetadataRejected(errors) if !errors.is_empty()));
}

#[test]
fn test_secret_failure_rolls_back_device() {
    let store = Arc::new(SledStore::temporary().unwrap());
    let provisioner = Provisioner::new(store.clone(), Arc::new(FailingSecrets), "h", 1);
    provisioner.register_model(new_model("m1")).unwrap();

    let mut request = new_device("m1", json!({ "site": "roof" }));
    request.id = Some("d9".to_string());
    assert!(matches!(
        provisioner.register_device(request),
        Err(ProvisionError::Store(_))
    ));
    assert!(store.get_device("d9").unwrap().is_none());
}

#[test]
fn test_seed_file_registers_models_then_devices() {
    let (provisioner, store, _) = provisioner();
    let seed: SeedFile = serde_json::from_value(json!({
        "models": [{ "id": "m1", "name": "thermometer", "telemetrySchema": temp_schema() }],
        "devices": [{ "id": "d1", "modelId": "m1", "name": "probe" }]
    }))
    .unwrap();

    let (models, devices) = provisioner.seed(seed).unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(devices[0].id, "d1");
    assert!(store.get_device("d1").unwrap().is_some());
}

#[test]
fn test_existing_device_id_is_rejected() {
    let (provisioner, store, secrets) = provisioner();
    provisioner.register_model(new_model("m1")).unwrap();
    let mut request = new_device("m1", json!({ "site": "roof" }));
    request.id = Some("d1".to_string());
    let original = provisioner.register_device(request.clone()).unwrap();
    let secret_path = original.connection.clone().unwrap().secret_path;
    let secret = secrets.read(&secret_path).unwrap();

    assert!(matches!(
        provisioner.register_device(request),
        Err(ProvisionError::DeviceExists(id)) if id == "d1"
    ));
    assert_eq!(store.get_device("d1").unwrap(), Some(original));
    assert_eq!(secrets.read(&secret_path).unwrap(), secret);
}
