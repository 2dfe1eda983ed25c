//! Document store backed by `sled`
//!
//! Devices and models are stored as JSON under their id. Telemetry records
//! live in one tree keyed by
//! `device_id | 0x00 | timestamp (order-preserving, nanos) | sequence`, so a
//! device's records form one contiguous, chronologically ordered range and a
//! time window is a single `range` scan.

use chrono::{DateTime, Utc};
use sled::{Db, IVec, Tree};
use tracing::debug;

use crate::persistence::model::{Device, DeviceModel, DeviceRecord};
use crate::persistence::store::{
    CredentialStore, RecordQuery, Sort, SortDirection, TelemetryStore,
};
use crate::utils::error::StoreError;

const DEVICES_TREE: &str = "device";
const MODELS_TREE: &str = "device_model";
const RECORDS_TREE: &str = "device_data";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    devices: Tree,
    models: Tree,
    records: Tree,
}

impl SledStore {
    /// Open or create a store at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// A throwaway store removed when dropped. Used by tests and dry runs.
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            devices: db.open_tree(DEVICES_TREE)?,
            models: db.open_tree(MODELS_TREE)?,
            records: db.open_tree(RECORDS_TREE)?,
            db,
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

fn get_json<T: serde::de::DeserializeOwned>(tree: &Tree, id: &str) -> Result<Option<T>, StoreError> {
    match tree.get(id.as_bytes())? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn device_prefix(device_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(device_id.len() + 1);
    prefix.extend_from_slice(device_id.as_bytes());
    prefix.push(0);
    prefix
}

/// Nanoseconds since the epoch with the sign bit flipped, so big-endian
/// byte order matches time order. Saturates outside the i64 nanosecond range.
fn ordered_nanos(at: DateTime<Utc>) -> [u8; 8] {
    let nanos = at.timestamp_nanos_opt().unwrap_or(if at.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    });
    ((nanos as u64) ^ (1 << 63)).to_be_bytes()
}

fn record_key(prefix: &[u8], at: DateTime<Utc>, seq: [u8; 8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 16);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&ordered_nanos(at));
    key.extend_from_slice(&seq);
    key
}

impl CredentialStore for SledStore {
    fn find_by_credentials(
        &self,
        username: &str,
        secret_ref: &str,
    ) -> Result<Option<Device>, StoreError> {
        let device: Option<Device> = get_json(&self.devices, username)?;
        Ok(device.filter(|d| {
            d.connection
                .as_ref()
                .is_some_and(|c| c.secret_path == secret_ref)
        }))
    }
}

impl TelemetryStore for SledStore {
    fn get_device(&self, id: &str) -> Result<Option<Device>, StoreError> {
        get_json(&self.devices, id)
    }

    fn save_device(&self, device: &Device) -> Result<(), StoreError> {
        self.devices
            .insert(device.id.as_bytes(), serde_json::to_vec(device)?)?;
        Ok(())
    }

    fn delete_device(&self, id: &str) -> Result<(), StoreError> {
        self.devices.remove(id.as_bytes())?;
        Ok(())
    }

    fn get_model(&self, id: &str) -> Result<Option<DeviceModel>, StoreError> {
        get_json(&self.models, id)
    }

    fn save_model(&self, model: &DeviceModel) -> Result<(), StoreError> {
        self.models
            .insert(model.id.as_bytes(), serde_json::to_vec(model)?)?;
        Ok(())
    }

    fn insert_record(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        // insertion sequence breaks ties between equal timestamps
        let seq = self.db.generate_id()?.to_be_bytes();
        let key = record_key(&device_prefix(&record.device_id), record.received_at, seq);
        self.records.insert(key, serde_json::to_vec(record)?)?;
        Ok(())
    }

    fn find_records(&self, query: &RecordQuery) -> Result<Vec<DeviceRecord>, StoreError> {
        if query.start > query.end {
            return Ok(Vec::new());
        }

        let prefix = device_prefix(&query.device_id);
        let lower = record_key(&prefix, query.start, [0x00; 8]);
        let upper = record_key(&prefix, query.end, [0xff; 8]);

        let descending = match &query.sort {
            Some(Sort { field, direction }) if field == Sort::RECEIVED_AT => {
                *direction == SortDirection::Desc
            }
            Some(Sort { field, .. }) => {
                debug!("Sort field '{field}' is not indexed, using insertion order");
                false
            }
            None => false,
        };

        let range = self.records.range(lower..=upper);
        let entries: Box<dyn Iterator<Item = sled::Result<(IVec, IVec)>>> = if descending {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };

        let (skip, take) = if query.limit > 0 {
            let limit = query.limit as usize;
            ((query.page.max(0) as usize).saturating_mul(limit), limit)
        } else {
            (0, usize::MAX)
        };

        let mut out = Vec::new();
        let mut skipped = 0usize;
        for entry in entries {
            if out.len() >= take {
                break;
            }
            let (_, value) = entry?;
            let record: DeviceRecord = serde_json::from_slice(&value)?;
            // timestamps beyond the nanosecond range share saturated keys
            if record.received_at < query.start || record.received_at > query.end {
                continue;
            }
            if skipped < skip {
                skipped += 1;
                continue;
            }
            out.push(record);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("records", &self.records.len())
            .finish()
    }
}
