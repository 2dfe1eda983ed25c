//! JSON Schema validation for device model schemas.
//!
//! The dialect is picked from the schema's `$schema` URI; anything
//! unrecognised (or missing) is validated as draft-07.

pub mod validator;

pub use validator::{SchemaValidator, detect_draft};
