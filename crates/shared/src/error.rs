use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("missing field `{0}`")]
    MissingField(String),
    #[error("field `{field}` has the wrong type: expected {expected}")]
    WrongType { field: String, expected: &'static str },
    #[error("field `{field}` could not be read: {source}")]
    Field {
        field: String,
        source: serde_json::Error,
    },
    #[error("payload does not match the expected shape: {0}")]
    Payload(serde_json::Error),
    #[error("Missing message type")]
    MissingType,
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("JSON parse error: {0}")]
    Decode(serde_json::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(serde_json::Error),
}

impl EnvelopeError {
    pub fn wrong_type(field: impl Into<String>, expected: &'static str) -> Self {
        Self::WrongType {
            field: field.into(),
            expected,
        }
    }

    /// True for errors raised while reading an inbound frame.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::NotAnObject(_))
    }
}
