//! Facets, the shared request context, and the per-facet task descriptors
//! built from them.

use crate::schema::SchemaDescriptor;
use crate::template::{ModelParameters, TemplateDocument};
use crate::variables::VariableBag;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// One independently researchable unit of a request, e.g. one property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facet {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
}

impl Facet {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Builds a facet from one record of a request's facet list.
    ///
    /// Object records take their id from `id_field`, falling back to
    /// `facet-<n>` (1-based). Scalar records become `{ "value": record }`
    /// with the scalar's text as id.
    pub fn from_record(record: &JsonValue, id_field: &str, index: usize) -> Self {
        let fallback = || format!("facet-{}", index + 1);
        match record {
            JsonValue::Object(fields) => {
                let id = match fields.get(id_field) {
                    Some(JsonValue::String(s)) if !s.is_empty() => s.clone(),
                    Some(value @ (JsonValue::Number(_) | JsonValue::Bool(_))) => value.to_string(),
                    _ => fallback(),
                };
                Self {
                    id,
                    fields: fields.clone(),
                }
            }
            JsonValue::String(s) if !s.is_empty() => Self::new(s.clone()).with_field("value", record.clone()),
            JsonValue::Number(_) | JsonValue::Bool(_) => {
                Self::new(record.to_string()).with_field("value", record.clone())
            }
            _ => Self::new(fallback()).with_field("value", record.clone()),
        }
    }
}

/// Request-wide context shared read-only by every facet of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    /// The health or domain concern the request is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concern: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub demographics: Map<String, JsonValue>,
    /// Items the user selected in earlier steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_items: Vec<JsonValue>,
    /// Any other request variables.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, JsonValue>,
}

const CONCERN: &str = "concern";
const DEMOGRAPHICS: &str = "demographics";
const SELECTED_ITEMS: &str = "selected_items";

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concern(mut self, concern: impl Into<String>) -> Self {
        self.concern = Some(concern.into());
        self
    }

    pub fn with_demographic(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.demographics.insert(key.into(), value.into());
        self
    }

    pub fn with_selected_item(mut self, item: impl Into<JsonValue>) -> Self {
        self.selected_items.push(item.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Splits request variables into the well-known context keys and extras.
    ///
    /// `exclude_key` (the facet list) is left out entirely.
    pub fn from_variables(variables: &VariableBag, exclude_key: &str) -> Self {
        let mut context = Self::default();
        for (key, value) in variables.iter() {
            match (key.as_str(), value) {
                (k, _) if k == exclude_key => {}
                (CONCERN, JsonValue::String(s)) => context.concern = Some(s.clone()),
                (DEMOGRAPHICS, JsonValue::Object(map)) => context.demographics = map.clone(),
                (SELECTED_ITEMS, JsonValue::Array(items)) => context.selected_items = items.clone(),
                _ => {
                    context.extra.insert(key.clone(), value.clone());
                }
            }
        }
        context
    }

    /// The context as template variables.
    pub fn to_variables(&self) -> VariableBag {
        let mut bag = VariableBag::new();
        if let Some(concern) = &self.concern {
            bag = bag.with(CONCERN, concern.as_str());
        }
        if !self.demographics.is_empty() {
            bag = bag.with(DEMOGRAPHICS, JsonValue::Object(self.demographics.clone()));
        }
        if !self.selected_items.is_empty() {
            bag = bag.with(SELECTED_ITEMS, JsonValue::Array(self.selected_items.clone()));
        }
        bag.merged(&VariableBag::from(self.extra.clone()))
    }
}

/// Everything needed to execute one facet's LLM call.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub facet_id: String,
    pub resolved_prompt: String,
    pub output_schema: SchemaDescriptor,
    pub model_parameters: ModelParameters,
    pub shared_context: Arc<SharedContext>,
}

/// Turns facets into [`TaskDescriptor`]s using one facet-scoped template.
#[derive(Debug, Clone)]
pub struct TaskDescriptorBuilder {
    template: Arc<TemplateDocument>,
}

impl TaskDescriptorBuilder {
    pub fn new(template: Arc<TemplateDocument>) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &TemplateDocument {
        &self.template
    }

    /// Variables seen by the template for `facet`.
    ///
    /// Shared context first, then the facet's fields (which win on key
    /// collisions), then `facet_id` and the whole record as `facet`.
    pub fn variables_for(&self, facet: &Facet, shared_context: &SharedContext) -> VariableBag {
        shared_context
            .to_variables()
            .merged(&VariableBag::from(facet.fields.clone()))
            .with("facet_id", facet.id.as_str())
            .with("facet", JsonValue::Object(facet.fields.clone()))
    }

    pub fn build(&self, facet: &Facet, shared_context: &Arc<SharedContext>) -> TaskDescriptor {
        let variables = self.variables_for(facet, shared_context);
        TaskDescriptor {
            facet_id: facet.id.clone(),
            resolved_prompt: self.template.render(&variables),
            output_schema: self.template.output_schema.clone(),
            model_parameters: self.template.model_parameters.clone(),
            shared_context: Arc::clone(shared_context),
        }
    }

    /// One descriptor per facet, in facet order.
    pub fn build_all(&self, facets: &[Facet], shared_context: &Arc<SharedContext>) -> Vec<TaskDescriptor> {
        facets
            .iter()
            .map(|facet| self.build(facet, shared_context))
            .collect()
    }
}
