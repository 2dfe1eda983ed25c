//! Validation & persistence stage: turns dequeued payloads into stored
//! `DeviceRecord`s, or drops them.

pub mod payload;
pub mod service;

pub use payload::TelemetryPayload;
pub use service::{DropReason, Outcome, TelemetryService, TelemetryStats};
