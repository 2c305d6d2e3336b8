//! Output schema descriptors and payload validation.
//!
//! Template documents carry a `schema:` block, a JSON Schema describing the
//! payload the LLM must produce. The schema is compiled once with
//! [`jsonschema`] when the descriptor is built; a schema that fails to
//! compile rejects every payload.

use jsonschema::JSONSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A payload did not match its schema.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Schema violation at {path}: {message}")]
pub struct SchemaError {
    /// JSON-path-like location of the offending value, e.g. `$.items[2].name`.
    pub path: String,
    pub message: String,
}

/// The output schema attached to a template document.
///
/// Equality, serialization and `Debug` only look at the raw schema.
#[derive(Clone)]
pub struct SchemaDescriptor {
    raw: JsonValue,
    compiled: Result<Arc<JSONSchema>, String>,
}

impl Default for SchemaDescriptor {
    fn default() -> Self {
        Self::any()
    }
}

impl SchemaDescriptor {
    pub fn new(schema: JsonValue) -> Self {
        let compiled = JSONSchema::compile(&schema)
            .map(Arc::new)
            .map_err(|e| e.to_string());
        Self { raw: schema, compiled }
    }

    /// A schema that accepts every value.
    pub fn any() -> Self {
        Self::new(JsonValue::Object(Default::default()))
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.raw
    }

    /// Fails if the schema itself is not a valid JSON Schema.
    pub fn check(&self) -> Result<(), SchemaError> {
        self.compiled.as_ref().map(|_| ()).map_err(|reason| SchemaError {
            path: "$".to_string(),
            message: format!("invalid schema: {reason}"),
        })
    }

    /// Checks `value` against the schema, reporting the first violation.
    pub fn validate(&self, value: &JsonValue) -> Result<(), SchemaError> {
        let compiled = match &self.compiled {
            Ok(compiled) => compiled,
            Err(_) => return self.check(),
        };
        let Err(mut errors) = compiled.validate(value) else {
            return Ok(());
        };
        match errors.next() {
            Some(error) => Err(SchemaError {
                path: json_path(&error.instance_path.to_string()),
                message: error.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// `/data/items/1` becomes `$.data.items[1]`.
fn json_path(pointer: &str) -> String {
    let mut path = String::from("$");
    for segment in pointer.split('/').skip(1) {
        if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            path.push_str(&format!("[{segment}]"));
        } else {
            path.push('.');
            path.push_str(&segment.replace("~1", "/").replace("~0", "~"));
        }
    }
    path
}

impl PartialEq for SchemaDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl fmt::Debug for SchemaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SchemaDescriptor").field(&self.raw).finish()
    }
}

impl Serialize for SchemaDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SchemaDescriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(Self::new)
    }
}
