use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::envelope::InboundEnvelope;
use super::sled_queue::QueueSource;
use crate::telemetry::{DropReason, Outcome, TelemetryPayload, TelemetryService};
use crate::utils::error::{ConsumeError, QueueError};

/// Drains the queue into the telemetry service for one consumer group.
pub struct BridgeConsumer {
    source: Arc<dyn QueueSource>,
    service: Arc<TelemetryService>,
    group: String,
    batch_size: usize,
    poll_interval: Duration,
}

impl BridgeConsumer {
    pub fn new(
        source: Arc<dyn QueueSource>,
        service: Arc<TelemetryService>,
        group: &str,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            service,
            group: group.to_string(),
            batch_size: batch_size.max(1),
            poll_interval,
        }
    }

    /// Process one record. The record key names the device; the envelope's
    /// own `deviceId` is only used when the key is empty.
    pub fn handle_record(&self, key: &str, value: &str) -> Result<Outcome, ConsumeError> {
        let envelope: InboundEnvelope = serde_json::from_str(value)?;
        let device_id = if key.is_empty() {
            envelope
                .device_id
                .filter(|id| !id.is_empty())
                .ok_or(ConsumeError::MissingDeviceId)?
        } else {
            key.to_string()
        };

        let payload = TelemetryPayload::from_value(envelope.payload);
        Ok(self
            .service
            .process_telemetry(&device_id, payload.into_map())?)
    }

    /// One pass over every partition. Returns the number of records seen.
    pub fn poll_once(&self) -> Result<usize, QueueError> {
        let mut seen = 0;
        for partition in 0..self.source.partitions() {
            let records = self.source.poll(&self.group, partition, self.batch_size)?;
            for record in records {
                match self.handle_record(&record.key, &record.value) {
                    Ok(Outcome::Stored(stored)) => {
                        debug!("Stored record {} for {}", stored.id, stored.device_id)
                    }
                    Ok(Outcome::Dropped(DropReason::SchemaViolation(errors))) => {
                        warn!("Telemetry from {} failed validation: {errors:?}", record.key)
                    }
                    Ok(Outcome::Dropped(reason)) => {
                        warn!("Dropped telemetry from {}: {reason:?}", record.key)
                    }
                    Err(e) => error!(
                        "Error processing record {} on partition {partition}: {e}",
                        record.offset
                    ),
                }
                self.source.commit(&self.group, partition, record.offset)?;
                seen += 1;
            }
        }
        Ok(seen)
    }

    /// Poll until `shutdown` flips to true or its sender goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Bridge consumer started for group '{}'", self.group);
        loop {
            if *shutdown.borrow() {
                break;
            }

            let seen = match self.poll_once() {
                Ok(seen) => seen,
                Err(e) => {
                    error!("Queue poll failed: {e}");
                    0
                }
            };
            if seen > 0 {
                continue;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("Bridge consumer for group '{}' stopped", self.group);
    }
}
