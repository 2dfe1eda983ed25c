use std::sync::Arc;

use tracing::{debug, error};

use super::envelope::Envelope;
use super::sled_queue::QueueProducer;

/// Hands authenticated publishes to the durable queue, keyed by device id.
///
/// Fire-and-forget: failures are logged here and never reach the gateway.
#[derive(Clone)]
pub struct Forwarder {
    producer: Arc<dyn QueueProducer>,
}

impl Forwarder {
    pub fn new(producer: Arc<dyn QueueProducer>) -> Self {
        Self { producer }
    }

    pub fn forward(&self, device_id: &str, topic: &str, payload: &[u8]) {
        let envelope = Envelope::new(device_id, topic, payload);
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize envelope for {device_id}: {e}");
                return;
            }
        };

        match self.producer.send(device_id, &text) {
            Ok(()) => debug!("Queued telemetry from {device_id} on '{topic}'"),
            Err(e) => error!("Failed to queue telemetry from {device_id}: {e}"),
        }
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Forwarder")
    }
}
