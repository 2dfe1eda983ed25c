//! # Telemetry Gateway
//!
//! `telemetry-gateway` accepts MQTT 3.1/3.1.1 devices over TCP, authenticates
//! them against stored credentials and carries their publishes through a
//! durable queue into a schema-validated telemetry store.
//!
//! ## Core Modules
//!
//! - `gateway`: MQTT codec, the per-connection state machine and the TCP listener.
//! - `queue`: The durable partitioned queue, the producer-side forwarder and the consumer.
//! - `telemetry`: Payload normalization, validation and persistence of telemetry records.
//! - `schema`: JSON Schema validation with dialect detection.
//! - `persistence`: Device, model, record and secret storage on `sled`.
//! - `provision`: Administrative seeding of models and devices.
//! - `config`: Handles loading and managing configuration.
//! - `utils`: Error types and logging setup.

pub mod config;
pub mod gateway;
pub mod persistence;
pub mod provision;
pub mod queue;
pub mod schema;
pub mod telemetry;
pub mod utils;

#[cfg(test)]
mod tests;
