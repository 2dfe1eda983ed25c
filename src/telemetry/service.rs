//! Validation and persistence of telemetry.
//!
//! `process_telemetry` is lossy on purpose: unknown devices, unknown models
//! and schema failures are dropped with a log line and reported as
//! [`Outcome::Dropped`]. Only storage failures come back as errors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::persistence::{DeviceRecord, RecordQuery, Sort, TelemetryStore};
use crate::schema::SchemaValidator;
use crate::utils::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    UnknownDevice,
    UnknownModel(String),
    SchemaViolation(Vec<String>),
    InvalidSchema(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Stored(DeviceRecord),
    Dropped(DropReason),
}

/// Snapshot of the service counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub stored: u64,
    pub unknown_device: u64,
    pub unknown_model: u64,
    pub schema_violation: u64,
    pub invalid_schema: u64,
}

impl TelemetryStats {
    pub fn dropped(&self) -> u64 {
        self.unknown_device + self.unknown_model + self.schema_violation + self.invalid_schema
    }
}

#[derive(Debug, Default)]
struct Counters {
    stored: AtomicU64,
    unknown_device: AtomicU64,
    unknown_model: AtomicU64,
    schema_violation: AtomicU64,
    invalid_schema: AtomicU64,
}

pub struct TelemetryService {
    store: Arc<dyn TelemetryStore>,
    validator: SchemaValidator,
    counters: Counters,
}

impl TelemetryService {
    pub fn new(store: Arc<dyn TelemetryStore>, validator: SchemaValidator) -> Self {
        Self {
            store,
            validator,
            counters: Counters::default(),
        }
    }

    pub fn process_telemetry(
        &self,
        device_id: &str,
        payload: Map<String, Value>,
    ) -> Result<Outcome, StoreError> {
        let Some(device) = self.store.get_device(device_id)? else {
            warn!("Dropping telemetry for unknown device {device_id}");
            return Ok(self.drop_with(DropReason::UnknownDevice));
        };

        let Some(model) = self.store.get_model(&device.model_id)? else {
            warn!(
                "Dropping telemetry for {device_id}: model {} not found",
                device.model_id
            );
            return Ok(self.drop_with(DropReason::UnknownModel(device.model_id)));
        };

        if let Some(schema) = &model.telemetry_schema {
            if let Err(reason) = self.check_payload(&payload, schema) {
                warn!("Dropping telemetry for {device_id}: {reason:?}");
                return Ok(self.drop_with(reason));
            }
        }

        let record = DeviceRecord {
            id: Uuid::new_v4().to_string(),
            device_id: device.id,
            model_id: model.id,
            telemetry_payload: payload,
            received_at: Utc::now(),
        };
        self.store.insert_record(&record)?;
        self.counters.stored.fetch_add(1, Ordering::Relaxed);
        debug!("Stored telemetry {} for {}", record.id, record.device_id);

        Ok(Outcome::Stored(record))
    }

    /// Records for `device_id` with `start <= received_at <= end`, newest
    /// first. `limit <= 0` returns everything in range.
    pub fn search_data(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
        page: i64,
    ) -> Result<Vec<DeviceRecord>, StoreError> {
        let records = self.store.find_records(&RecordQuery {
            device_id: device_id.to_string(),
            start,
            end,
            limit,
            page,
            sort: Some(Sort::new(Sort::RECEIVED_AT, "desc")),
        })?;
        info!(
            "Found {} records for {device_id} between {start} and {end}",
            records.len()
        );
        Ok(records)
    }

    pub fn stats(&self) -> TelemetryStats {
        let c = &self.counters;
        TelemetryStats {
            stored: c.stored.load(Ordering::Relaxed),
            unknown_device: c.unknown_device.load(Ordering::Relaxed),
            unknown_model: c.unknown_model.load(Ordering::Relaxed),
            schema_violation: c.schema_violation.load(Ordering::Relaxed),
            invalid_schema: c.invalid_schema.load(Ordering::Relaxed),
        }
    }

    fn check_payload(&self, payload: &Map<String, Value>, schema: &Value) -> Result<(), DropReason> {
        let document = serde_json::to_string(payload)
            .map_err(|e| DropReason::InvalidSchema(e.to_string()))?;
        let schema = serde_json::to_string(schema)
            .map_err(|e| DropReason::InvalidSchema(e.to_string()))?;

        match self.validator.validate(&document, &schema) {
            Ok(errors) if errors.is_empty() => Ok(()),
            Ok(errors) => Err(DropReason::SchemaViolation(errors)),
            Err(e) => Err(DropReason::InvalidSchema(e.to_string())),
        }
    }

    fn drop_with(&self, reason: DropReason) -> Outcome {
        let counter = match &reason {
            DropReason::UnknownDevice => &self.counters.unknown_device,
            DropReason::UnknownModel(_) => &self.counters.unknown_model,
            DropReason::SchemaViolation(_) => &self.counters.schema_violation,
            DropReason::InvalidSchema(_) => &self.counters.invalid_schema,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Outcome::Dropped(reason)
    }
}
