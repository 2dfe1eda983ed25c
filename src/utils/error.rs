//! The `error` module defines the error types shared across the gateway,
//! queue bridge and storage layers.
//!
//! Each layer owns one enum. Silent drops in the telemetry path are *not*
//! errors; they are modelled as `telemetry::Outcome::Dropped` so callers can
//! tell a rejected message apart from a broken store.

use thiserror::Error;

/// Failures decoding or encoding MQTT frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of frame")]
    UnexpectedEof,

    #[error("malformed remaining length")]
    MalformedLength,

    #[error("packet of {size} bytes exceeds limit of {limit}")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("invalid utf-8 in mqtt string")]
    InvalidUtf8,

    #[error("unsupported packet type {0}")]
    UnsupportedPacketType(u8),

    #[error("invalid fixed header flags {flags:#06b} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    #[error("unsupported qos {0}")]
    InvalidQos(u8),

    #[error("invalid topic name '{0}'")]
    InvalidTopic(String),

    #[error("unsupported protocol name '{0}'")]
    InvalidProtocolName(String),

    #[error("{0}")]
    Malformed(&'static str),
}

/// Failures talking to the document store or the secret store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures appending to or reading from the durable queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("partition {0} does not exist")]
    UnknownPartition(usize),

    #[error("queue must have at least one partition")]
    NoPartitions,
}

/// Schema problems: the document was not JSON, or the schema did not compile.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("malformed json: {0}")]
    Malformed(String),

    #[error("invalid schema: {0}")]
    Invalid(String),
}

/// Errors surfaced to the administrative seeding path.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{0} is mandatory")]
    Missing(&'static str),

    #[error("invalid {field} schema: {source}")]
    InvalidSchema {
        field: &'static str,
        #[source]
        source: SchemaError,
    },

    #[error("device model not found for id: {0}")]
    UnknownModel(String),

    #[error("device already exists: {0}")]
    DeviceExists(String),

    #[error("metadata validation failed: {0:?}")]
    MetadataRejected(Vec<String>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures handling one dequeued record. Logged and skipped by the consumer.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("undecodable envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("envelope carries no device id")]
    MissingDeviceId,

    #[error(transparent)]
    Store(#[from] StoreError),
}
