//! Store contracts the core depends on.
//!
//! The gateway only needs [`CredentialStore`]; the telemetry service needs
//! [`TelemetryStore`]. Both are implemented by `SledStore`.

use chrono::{DateTime, Utc};

use crate::persistence::model::{Device, DeviceModel, DeviceRecord};
use crate::utils::error::StoreError;

pub trait CredentialStore: Send + Sync {
    /// Find the device whose id equals `username` and whose stored secret
    /// reference equals `secret_ref`.
    fn find_by_credentials(
        &self,
        username: &str,
        secret_ref: &str,
    ) -> Result<Option<Device>, StoreError>;
}

pub trait TelemetryStore: Send + Sync {
    fn get_device(&self, id: &str) -> Result<Option<Device>, StoreError>;
    fn save_device(&self, device: &Device) -> Result<(), StoreError>;
    fn delete_device(&self, id: &str) -> Result<(), StoreError>;
    fn get_model(&self, id: &str) -> Result<Option<DeviceModel>, StoreError>;
    fn save_model(&self, model: &DeviceModel) -> Result<(), StoreError>;
    fn insert_record(&self, record: &DeviceRecord) -> Result<(), StoreError>;
    fn find_records(&self, query: &RecordQuery) -> Result<Vec<DeviceRecord>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// `"desc"` in any case is descending; everything else is ascending.
    pub fn parse(direction: &str) -> Self {
        if direction.eq_ignore_ascii_case("desc") {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

impl Sort {
    pub const RECEIVED_AT: &'static str = "received_at";

    pub fn new(field: &str, direction: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::parse(direction),
        }
    }
}

/// Range query over one device's records, bounds inclusive.
///
/// `limit <= 0` disables paging; otherwise `page * limit` records are skipped.
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub device_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub limit: i64,
    pub page: i64,
    pub sort: Option<Sort>,
}
