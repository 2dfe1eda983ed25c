use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::warn;

use crate::utils::error::SchemaError;

/// Pick the JSON Schema dialect named by `$schema`, defaulting to draft-07.
pub fn detect_draft(schema: &Value) -> Draft {
    known_draft(schema).unwrap_or(Draft::Draft7)
}

fn known_draft(schema: &Value) -> Option<Draft> {
    let uri = schema.get("$schema").and_then(Value::as_str)?;

    if uri.contains("json-schema.org/draft/2020-12/schema") {
        Some(Draft::Draft202012)
    } else if uri.contains("json-schema.org/draft/2019-09/schema") {
        Some(Draft::Draft201909)
    } else if uri.contains("json-schema.org/draft-07/schema") {
        Some(Draft::Draft7)
    } else if uri.contains("json-schema.org/draft-06/schema") {
        Some(Draft::Draft6)
    } else if uri.contains("json-schema.org/draft-04/schema") {
        Some(Draft::Draft4)
    } else {
        None
    }
}

/// Compiles schemas and collects violation messages.
///
/// Stateless; shared behind an `Arc` by the telemetry service and the
/// provisioning path.
#[derive(Debug, Default, Clone)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate `document` text against `schema` text.
    ///
    /// An empty vector means the document conforms. A schema that is not JSON
    /// or does not compile is reported as `SchemaError`, never as a violation.
    pub fn validate(&self, document: &str, schema: &str) -> Result<Vec<String>, SchemaError> {
        let schema: Value =
            serde_json::from_str(schema).map_err(|e| SchemaError::Malformed(e.to_string()))?;
        let document: Value =
            serde_json::from_str(document).map_err(|e| SchemaError::Malformed(e.to_string()))?;

        self.validate_value(&document, &schema)
    }

    /// Same as [`validate`](Self::validate) for already-parsed values.
    pub fn validate_value(
        &self,
        document: &Value,
        schema: &Value,
    ) -> Result<Vec<String>, SchemaError> {
        let validator = compile(schema)?;

        Ok(validator
            .iter_errors(document)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect())
    }

    /// Check that `schema` compiles under its detected dialect.
    pub fn check_schema(&self, schema: &Value) -> Result<(), SchemaError> {
        compile(schema).map(|_| ()).inspect_err(|e| warn!("Invalid schema: {e}"))
    }
}

fn compile(schema: &Value) -> Result<Validator, SchemaError> {
    let draft = known_draft(schema);

    // an unrecognised `$schema` would otherwise be resolved as a meta-schema
    let stripped;
    let schema = match schema {
        Value::Object(map) if draft.is_none() && map.contains_key("$schema") => {
            let mut map = map.clone();
            map.remove("$schema");
            stripped = Value::Object(map);
            &stripped
        }
        _ => schema,
    };

    jsonschema::options()
        .with_draft(draft.unwrap_or(Draft::Draft7))
        .build(schema)
        .map_err(|e| SchemaError::Invalid(e.to_string()))
}
