//! Pulling JSON payloads out of free-form LLM output.
//!
//! Models wrap JSON in prose, Markdown fences or `<answer>` tags. The
//! extractors here locate the payload text; [`parse_json_payload`] then parses
//! it.
//!
//! ```rust
//! use llm_fanout::extract::parse_json_payload;
//!
//! let response = "Here's the data:\n```json\n{\"status\": \"ok\", \"count\": 42}\n```";
//! let payload = parse_json_payload(response).unwrap();
//! assert_eq!(payload["count"], 42);
//! ```

pub mod error;
pub mod extractors;

pub use self::error::ParseError;
pub use self::extractors::{ExtractionStrategy, FlexibleExtractor, MarkdownCodeBlockExtractor};

use serde_json::Value as JsonValue;

/// Returns the JSON text embedded in `text` using the standard strategies.
pub fn extract_json(text: &str) -> Result<String, ParseError> {
    FlexibleExtractor::new().extract(text)
}

/// Extracts and parses the JSON payload embedded in `text`.
///
/// Text that is already bare JSON is parsed directly.
pub fn parse_json_payload(text: &str) -> Result<JsonValue, ParseError> {
    if let Ok(value) = serde_json::from_str::<JsonValue>(text.trim())
        && (value.is_object() || value.is_array())
    {
        return Ok(value);
    }
    let candidate = extract_json(text)?;
    serde_json::from_str(&candidate).map_err(|e| ParseError::JsonParsingFailed(e.to_string()))
}
