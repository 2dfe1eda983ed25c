//! Queue bridge: the gateway side appends envelopes to a durable partitioned
//! queue, the consumer side drains it into the telemetry service.

pub mod consumer;
pub mod envelope;
pub mod producer;
pub mod sled_queue;

pub use consumer::BridgeConsumer;
pub use envelope::{Envelope, InboundEnvelope};
pub use producer::Forwarder;
pub use sled_queue::{QueueProducer, QueueRecord, QueueSource, SledQueue};
