//! Secret storage for device credentials.
//!
//! Secrets are written under `secret/<suffix>`; the returned path is what a
//! device presents as its MQTT password.

use sled::{Db, Tree};
use tracing::info;
use uuid::Uuid;

use crate::utils::error::StoreError;

pub const SECRET_PREFIX: &str = "secret/";

pub trait SecretManager: Send + Sync {
    /// Generate a fresh secret, store it under `path_suffix` and return the
    /// secret path.
    fn generate_and_store(&self, path_suffix: &str) -> Result<String, StoreError>;

    fn store(&self, path_suffix: &str, secret: &str) -> Result<String, StoreError>;

    fn read(&self, secret_path: &str) -> Result<Option<String>, StoreError>;
}

#[derive(Clone)]
pub struct SledSecretStore {
    tree: Tree,
}

impl SledSecretStore {
    pub fn open(db: &Db) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree("secrets")?,
        })
    }
}

impl SecretManager for SledSecretStore {
    fn generate_and_store(&self, path_suffix: &str) -> Result<String, StoreError> {
        let secret = Uuid::new_v4().simple().to_string();
        let path = self.store(path_suffix, &secret)?;
        info!("Generated secret for {path_suffix} at {path}");
        Ok(path)
    }

    fn store(&self, path_suffix: &str, secret: &str) -> Result<String, StoreError> {
        let path = format!("{SECRET_PREFIX}{path_suffix}");
        self.tree.insert(path.as_bytes(), secret.as_bytes())?;
        Ok(path)
    }

    fn read(&self, secret_path: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .tree
            .get(secret_path.as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }
}
