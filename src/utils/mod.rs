//! Shared utilities: the per-layer error enums and tracing setup.

pub mod error;
pub mod logging;
