//! The key/value context fed into template resolution.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// An insertion-ordered bag of template variables.
///
/// Values are plain JSON: scalars, nested objects, or sequences of records.
/// A bag is assembled once with the consuming builder methods and is read-only
/// afterwards.
///
/// # Examples
///
/// ```
/// use llm_fanout::VariableBag;
/// use serde_json::json;
///
/// let vars = VariableBag::new()
///     .with("name", "Ana")
///     .with("xs", json!(["a", "b"]));
///
/// assert_eq!(vars.get("name"), Some(&json!("Ana")));
/// assert_eq!(vars.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableBag {
    entries: Map<String, JsonValue>,
}

impl VariableBag {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a variable and returns the bag.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Returns a bag holding `self`'s entries overlaid with `other`'s.
    ///
    /// Keys present in both keep their original position but take `other`'s value.
    pub fn merged(mut self, other: &VariableBag) -> Self {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
        self
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.entries.get(key)
    }

    /// Looks up a dot-delimited path such as `profile.age`.
    pub fn lookup_path(&self, path: &str) -> Option<&JsonValue> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let mut current = self.entries.get(head)?;
        for segment in segments {
            current = step_into(current, segment)?;
        }
        Some(current)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.entries.iter()
    }

    /// Borrows the underlying JSON map.
    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.entries
    }

    /// Builds a bag from a JSON value, which must be an object.
    pub fn from_json(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(entries) => Some(Self { entries }),
            _ => None,
        }
    }
}

impl From<Map<String, JsonValue>> for VariableBag {
    fn from(entries: Map<String, JsonValue>) -> Self {
        Self { entries }
    }
}

impl FromIterator<(String, JsonValue)> for VariableBag {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Walks a dot-delimited path from `root`.
///
/// An empty path returns `root` itself. Numeric segments index into arrays.
pub fn value_at_path<'a>(root: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.')
        .try_fold(root, |current, segment| step_into(current, segment))
}

fn step_into<'a>(value: &'a JsonValue, segment: &str) -> Option<&'a JsonValue> {
    match value {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}
