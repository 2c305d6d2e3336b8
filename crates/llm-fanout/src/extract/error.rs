/// Errors raised while pulling a JSON payload out of free-form model text.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("Failed to extract tagged content: {0}")]
    TagExtractionFailed(String),

    #[error("Extracted content is not valid JSON: {0}")]
    JsonParsingFailed(String),

    #[error("No extraction strategy matched: {0:?}")]
    AllStrategiesFailed(Vec<String>),

    #[error("Invalid extraction pattern: {0}")]
    InvalidFormat(String),
}
