//! Template documents: model parameters, a prompt body and an output schema.
//!
//! Documents are YAML files in the following shape:
//!
//! ```yaml
//! version: "1.0"
//! description: Find supporting items for one property
//! config:
//!   model: claude-sonnet-4-5
//!   temperature: 0.4
//!   max_tokens: 2048
//! template: |
//!   Concern: {{concern}}
//!   {{#each items}}{{name}}{{#unless @last}}, {{/unless}}{{/each}}
//! schema:
//!   type: object
//!   required: [data]
//! ```
//!
//! `template`, `config`, `config.model`, `config.temperature`,
//! `config.max_tokens` and `schema` are required; anything missing is a
//! load-time [`TemplateError::Malformed`].

pub mod resolver;
pub mod store;

pub use resolver::resolve;
pub use store::{DirectorySource, InMemorySource, TemplateSource, TemplateStore};

use crate::schema::SchemaDescriptor;
use crate::variables::VariableBag;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Errors raised while locating or parsing template documents.
///
/// These indicate deployment or configuration bugs and are always propagated
/// to the caller.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// No document is registered under the requested name.
    #[error("No template document registered under '{0}'")]
    NotFound(String),

    /// The document exists but is missing required fields or does not parse.
    #[error("Malformed template document '{name}': {reason}")]
    Malformed { name: String, reason: String },

    /// The backing source could not be read.
    #[error("Failed to read template document '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl TemplateError {
    fn malformed(name: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// LLM call parameters declared under `config:`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub model_id: String,
    pub temperature: f64,
    pub max_output_tokens: u32,
    /// Any further keys under `config:` (e.g. `top_p`), passed through untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, JsonValue>,
}

impl ModelParameters {
    pub fn new(model_id: impl Into<String>, temperature: f64, max_output_tokens: u32) -> Self {
        Self {
            model_id: model_id.into(),
            temperature,
            max_output_tokens,
            extra: Map::new(),
        }
    }
}

/// Streaming hints for single-call documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    /// Dot-delimited path of the array to surface item by item, e.g. `data.items`.
    pub target_path: String,
}

/// Declares that a document fans out into one sub-task per facet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutSpec {
    /// Key in the request variables holding the facet records.
    pub facets_key: String,
    /// Field of each facet record used as its `facet_id`.
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Name of the facet-scoped template document.
    pub template: String,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_id_field() -> String {
    "id".to_string()
}

/// A loaded, immutable template document.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateDocument {
    pub name: String,
    pub version: String,
    pub description: String,
    pub model_parameters: ModelParameters,
    pub body: String,
    pub output_schema: SchemaDescriptor,
    pub stream: Option<StreamSpec>,
    pub fan_out: Option<FanOutSpec>,
}

#[derive(Deserialize)]
struct RawDocument {
    version: Option<JsonValue>,
    description: Option<String>,
    config: Option<RawConfig>,
    template: Option<String>,
    schema: Option<JsonValue>,
    stream: Option<StreamSpec>,
    fan_out: Option<FanOutSpec>,
}

#[derive(Deserialize)]
struct RawConfig {
    model: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    #[serde(flatten)]
    extra: Map<String, JsonValue>,
}

impl TemplateDocument {
    /// Parses a YAML document registered under `name`.
    pub fn from_yaml_str(name: &str, text: &str) -> Result<Self, TemplateError> {
        let raw: RawDocument =
            serde_yaml::from_str(text).map_err(|e| TemplateError::malformed(name, e.to_string()))?;

        let body = raw
            .template
            .ok_or_else(|| TemplateError::malformed(name, "missing required field `template`"))?;
        let config = raw
            .config
            .ok_or_else(|| TemplateError::malformed(name, "missing required field `config`"))?;
        let model_id = config
            .model
            .ok_or_else(|| TemplateError::malformed(name, "missing required field `config.model`"))?;
        let temperature = config.temperature.ok_or_else(|| {
            TemplateError::malformed(name, "missing required field `config.temperature`")
        })?;
        let max_output_tokens = config.max_tokens.ok_or_else(|| {
            TemplateError::malformed(name, "missing required field `config.max_tokens`")
        })?;
        let schema = match raw.schema {
            Some(JsonValue::Null) | None => {
                return Err(TemplateError::malformed(name, "missing required field `schema`"));
            }
            Some(schema) => SchemaDescriptor::new(schema),
        };
        schema
            .check()
            .map_err(|e| TemplateError::malformed(name, e.message))?;

        let version = match raw.version {
            Some(JsonValue::String(v)) => v,
            Some(JsonValue::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        Ok(Self {
            name: name.to_string(),
            version,
            description: raw.description.unwrap_or_default(),
            model_parameters: ModelParameters {
                model_id,
                temperature,
                max_output_tokens,
                extra: config.extra,
            },
            body,
            output_schema: schema,
            stream: raw.stream,
            fan_out: raw.fan_out,
        })
    }

    /// Resolves the body against `variables`.
    pub fn render(&self, variables: &VariableBag) -> String {
        resolve(&self.body, variables)
    }
}
