//! Incremental extraction of array elements from a streamed JSON document.
//!
//! LLM responses arrive as text fragments. [`IncrementalAssembler`] buffers
//! them and, after every feed, reports the elements of one target array that
//! have become complete, so callers can render them before the response ends.
//!
//! ```
//! use llm_fanout::assembler::IncrementalAssembler;
//!
//! let mut assembler = IncrementalAssembler::new("data.items");
//! assert!(assembler.feed(r#"{"data": {"items": [{"name": "Cha"#).is_empty());
//! let items = assembler.feed(r#"momile"}, {"name": "Lav"#);
//! assert_eq!(items[0]["name"], "Chamomile");
//!
//! assembler.feed(r#"ender"}]}}"#);
//! let document = assembler.finalize().unwrap();
//! assert_eq!(document["data"]["items"][1]["name"], "Lavender");
//! ```

pub mod scanner;

pub use scanner::{JsonScanner, first_json_entity};

use crate::schema::SchemaDescriptor;
use crate::variables::value_at_path;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AssemblerError {
    /// The stream ended before a complete, conforming document was received.
    ///
    /// Items already returned from `feed` stay valid.
    #[error("Incomplete stream after {emitted} emitted item(s): {reason}")]
    IncompleteStream { reason: String, emitted: usize },
}

/// One element of the target array, with its position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssembledItem {
    pub index: usize,
    pub value: JsonValue,
}

/// Buffers a streamed JSON document and surfaces target array elements as
/// soon as they close.
#[derive(Debug)]
pub struct IncrementalAssembler {
    target_path: String,
    buffer: Vec<u8>,
    scanner: JsonScanner,
    emitted: usize,
    schema: Option<SchemaDescriptor>,
}

impl IncrementalAssembler {
    /// `target_path` is dot-delimited, e.g. `data.items`. An empty path
    /// targets a root array.
    pub fn new(target_path: impl Into<String>) -> Self {
        let target_path = target_path.into();
        Self {
            scanner: JsonScanner::with_target(&target_path),
            target_path,
            buffer: Vec::new(),
            emitted: 0,
            schema: None,
        }
    }

    /// Validates the finalized document against `schema`.
    pub fn with_schema(mut self, schema: SchemaDescriptor) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    /// Number of items returned so far.
    pub fn emitted_count(&self) -> usize {
        self.emitted
    }

    /// Whether the root value has closed.
    pub fn is_complete(&self) -> bool {
        self.scanner.is_complete()
    }

    /// Appends a fragment and returns newly completed elements in order.
    pub fn feed(&mut self, fragment: &str) -> Vec<JsonValue> {
        self.feed_bytes(fragment.as_bytes())
    }

    /// Like [`feed`](Self::feed), for raw bytes that may split a UTF-8 sequence.
    pub fn feed_bytes(&mut self, fragment: &[u8]) -> Vec<JsonValue> {
        self.feed_items(fragment)
            .into_iter()
            .map(|item| item.value)
            .collect()
    }

    /// Like [`feed_bytes`](Self::feed_bytes), keeping each element's index.
    pub fn feed_items(&mut self, fragment: &[u8]) -> Vec<AssembledItem> {
        if self.scanner.is_complete() {
            // Anything after the root value is ignored.
            return Vec::new();
        }
        self.buffer.extend_from_slice(fragment);

        let mut items = Vec::new();
        for span in self.scanner.scan(&self.buffer) {
            if span.index < self.emitted {
                continue;
            }
            match serde_json::from_slice::<JsonValue>(&self.buffer[span.range.clone()]) {
                Ok(value) => {
                    debug!(index = span.index, target = %self.target_path, "Assembled stream item");
                    self.emitted = span.index + 1;
                    items.push(AssembledItem {
                        index: span.index,
                        value,
                    });
                }
                Err(e) => {
                    warn!(index = span.index, error = %e, "Skipping unparseable stream item");
                    self.emitted = span.index + 1;
                }
            }
        }
        items
    }

    /// Parses the buffered document.
    ///
    /// # Errors
    ///
    /// [`AssemblerError::IncompleteStream`] when the root value never closed,
    /// does not parse, has no array at the target path, or violates the
    /// schema given to [`with_schema`](Self::with_schema).
    pub fn finalize(self) -> Result<JsonValue, AssemblerError> {
        let incomplete = |reason: String| AssemblerError::IncompleteStream {
            reason,
            emitted: self.emitted,
        };

        let Some(range) = self.scanner.root_span() else {
            return Err(incomplete(format!(
                "document did not close after {} buffered byte(s)",
                self.buffer.len()
            )));
        };

        let document: JsonValue = serde_json::from_slice(&self.buffer[range])
            .map_err(|e| incomplete(format!("document does not parse: {e}")))?;

        match value_at_path(&document, &self.target_path) {
            Some(JsonValue::Array(_)) => {}
            Some(_) => {
                return Err(incomplete(format!("'{}' is not an array", self.target_path)));
            }
            None => {
                return Err(incomplete(format!("'{}' is missing", self.target_path)));
            }
        }

        if let Some(schema) = &self.schema {
            schema
                .validate(&document)
                .map_err(|e| incomplete(e.to_string()))?;
        }

        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_emits_each_element_once_as_it_closes() {
        let mut assembler = IncrementalAssembler::new("items");

        assert_eq!(assembler.feed(r#"{"items": [{"n": 1}, {"n""#), vec![json!({"n": 1})]);
        assert_eq!(assembler.emitted_count(), 1);
        assert_eq!(assembler.feed(": 2}"), vec![json!({"n": 2})]);
        assert!(assembler.feed("]}").is_empty());
        assert!(assembler.is_complete());

        let document = assembler.finalize().unwrap();
        assert_eq!(document, json!({"items": [{"n": 1}, {"n": 2}]}));
    }

    #[test]
    fn test_duplicated_fragment_is_not_emitted_twice() {
        let mut assembler = IncrementalAssembler::new("items");
        let first = assembler.feed(r#"{"items": [{"a": 1}"#);
        let repeat = assembler.feed(r#"{"a": 1}"#);

        assert_eq!(first, vec![json!({"a": 1})]);
        assert!(repeat.is_empty());
        assert_eq!(assembler.emitted_count(), 1);
    }

    #[test]
    fn test_duplicated_document_after_close_is_ignored() {
        let doc = r#"{"items": ["x"]}"#;
        let mut assembler = IncrementalAssembler::new("items");
        assert_eq!(assembler.feed(doc).len(), 1);
        assert!(assembler.feed(doc).is_empty());
        assert_eq!(assembler.finalize().unwrap(), json!({"items": ["x"]}));
    }

    #[test]
    fn test_split_utf8_sequence_is_buffered() {
        let text = "[\"caf\u{e9}\"]";
        let bytes = text.as_bytes();
        let split = text.find('\u{e9}').unwrap() + 1;

        let mut assembler = IncrementalAssembler::new("");
        assert!(assembler.feed_bytes(&bytes[..split]).is_empty());
        assert_eq!(assembler.feed_bytes(&bytes[split..]), vec![json!("caf\u{e9}")]);
    }

    #[test]
    fn test_feed_items_reports_indices() {
        let mut assembler = IncrementalAssembler::new("");
        let items = assembler.feed_items(b"[10, 20, ");
        assert_eq!(
            items,
            vec![
                AssembledItem { index: 0, value: json!(10) },
                AssembledItem { index: 1, value: json!(20) },
            ]
        );
        let items = assembler.feed_items(b"30]");
        assert_eq!(items[0].index, 2);
    }

    #[test]
    fn test_finalize_incomplete_keeps_emitted_count() {
        let mut assembler = IncrementalAssembler::new("items");
        assembler.feed(r#"{"items": [1, 2, {"partial": "#);
        match assembler.finalize() {
            Err(AssemblerError::IncompleteStream { emitted, .. }) => assert_eq!(emitted, 2),
            other => panic!("Expected IncompleteStream, got {other:?}"),
        }
    }

    #[test]
    fn test_finalize_requires_array_at_target() {
        let mut assembler = IncrementalAssembler::new("items");
        assembler.feed(r#"{"items": {"not": "array"}}"#);
        let err = assembler.finalize().unwrap_err();
        assert!(err.to_string().contains("not an array"));

        let mut assembler = IncrementalAssembler::new("data.items");
        assembler.feed(r#"{"data": {}}"#);
        assert!(assembler.finalize().unwrap_err().to_string().contains("missing"));
    }

    #[test]
    fn test_finalize_validates_schema() {
        let schema = SchemaDescriptor::new(json!({
            "type": "object",
            "properties": {"items": {"type": "array", "items": {"type": "string"}}}
        }));
        let mut assembler = IncrementalAssembler::new("items").with_schema(schema);
        assembler.feed(r#"{"items": ["ok", 3]}"#);
        let err = assembler.finalize().unwrap_err();
        assert!(err.to_string().contains("$.items[1]"));
    }
}
