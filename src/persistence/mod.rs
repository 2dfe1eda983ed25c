//! The `persistence` module holds the device, model and telemetry documents
//! plus the secrets devices authenticate with.
//!
//! Everything is stored in `sled`. The rest of the crate talks to it only
//! through the [`CredentialStore`], [`TelemetryStore`] and [`SecretManager`]
//! traits, so tests can swap in their own implementations.

pub mod model;
pub mod secrets;
pub mod sled_store;
pub mod store;

pub use model::{ConnectionDetails, Device, DeviceModel, DeviceRecord, DeviceStatus};
pub use secrets::{SecretManager, SledSecretStore};
pub use sled_store::SledStore;
pub use store::{CredentialStore, RecordQuery, Sort, SortDirection, TelemetryStore};
