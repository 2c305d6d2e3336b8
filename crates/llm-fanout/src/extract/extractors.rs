use super::error::ParseError;
use crate::assembler::first_json_entity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One way of locating a payload inside model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExtractionStrategy {
    /// Content of a Markdown fence, optionally restricted to one language.
    MarkdownFence(Option<String>),

    /// Content within XML-like tags: `<tag>content</tag>`.
    TaggedContent(String),

    /// The first balanced JSON object or array.
    FirstJsonEntity,
}

/// Tries extraction strategies in order and returns the first match.
#[derive(Debug, Clone)]
pub struct FlexibleExtractor {
    strategies: Vec<ExtractionStrategy>,
}

impl FlexibleExtractor {
    pub fn new() -> Self {
        Self {
            strategies: Self::standard_extraction_strategies(),
        }
    }

    pub fn with_strategies(strategies: Vec<ExtractionStrategy>) -> Self {
        Self { strategies }
    }

    /// A `json` fence, then any fence holding JSON, then `<answer>` tags, then
    /// the first JSON entity in the text.
    pub fn standard_extraction_strategies() -> Vec<ExtractionStrategy> {
        vec![
            ExtractionStrategy::MarkdownFence(Some("json".to_string())),
            ExtractionStrategy::MarkdownFence(None),
            ExtractionStrategy::TaggedContent("answer".to_string()),
            ExtractionStrategy::FirstJsonEntity,
        ]
    }

    pub fn extract(&self, text: &str) -> Result<String, ParseError> {
        let mut errors = Vec::new();

        for strategy in &self.strategies {
            if let Some(result) = self.extract_with_strategy(text, strategy) {
                debug!(?strategy, "Extracted payload candidate");
                return Ok(result);
            }
            errors.push(format!("Strategy {strategy:?} failed"));
        }

        Err(ParseError::AllStrategiesFailed(errors))
    }

    pub fn extract_with_strategy(&self, text: &str, strategy: &ExtractionStrategy) -> Option<String> {
        match strategy {
            ExtractionStrategy::MarkdownFence(language) => {
                let block = MarkdownCodeBlockExtractor {
                    language: language.clone(),
                }
                .extract(text)
                .ok()?;
                // An untagged fence only counts if it holds JSON.
                if language.is_none() {
                    return first_json_entity(&block).map(str::to_string);
                }
                Some(block)
            }
            ExtractionStrategy::TaggedContent(tag) => extract_tagged(text, tag),
            ExtractionStrategy::FirstJsonEntity => first_json_entity(text).map(str::to_string),
        }
    }
}

impl Default for FlexibleExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_tagged(text: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?s)<{tag}>(.*?)</{tag}>", tag = regex::escape(tag));
    let regex = Regex::new(&pattern).ok()?;
    let content = regex.captures(text)?.get(1)?;
    Some(content.as_str().trim().to_string())
}

/// Extractor for Markdown code blocks.
#[derive(Debug, Clone, Default)]
pub struct MarkdownCodeBlockExtractor {
    /// Language to filter by (e.g. `json`); `None` accepts any fence.
    pub language: Option<String>,
}

impl MarkdownCodeBlockExtractor {
    pub fn new() -> Self {
        Self { language: None }
    }

    pub fn with_language(language: impl Into<String>) -> Self {
        Self {
            language: Some(language.into()),
        }
    }

    pub fn extract(&self, text: &str) -> Result<String, ParseError> {
        let pattern = match &self.language {
            Some(lang) => format!(
                r"(?m)^\s*```\s*{}\s*\n((?:.*\n)*?)^\s*```\s*$",
                regex::escape(lang)
            ),
            None => r"(?m)^\s*```[^\n]*\n((?:.*\n)*?)^\s*```\s*$".to_string(),
        };

        let regex = Regex::new(&pattern)
            .map_err(|e| ParseError::InvalidFormat(format!("Failed to compile regex: {e}")))?;

        if let Some(captures) = regex.captures(text)
            && let Some(content) = captures.get(1)
        {
            return Ok(content.as_str().trim_end().to_string());
        }

        Err(ParseError::TagExtractionFailed(match &self.language {
            Some(lang) => format!("No markdown code block found with language '{lang}'"),
            None => "No markdown code block found".to_string(),
        }))
    }
}
