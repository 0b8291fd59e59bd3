use shared::EnvelopeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("websocket receive failed: {0}")]
    Receive(String),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("WebSocket not connected")]
    NotConnected,
    #[error("transport writer is closed")]
    LinkClosed,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("handler type key must not be empty")]
    EmptyTypeKey,
    #[error("{0}")]
    MissingType(String),
    #[error("No handler registered for `{0}`")]
    NoHandler(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("User not authenticated")]
    NotAuthenticated,
    #[error("WebSocket not connected")]
    NotConnected,
    #[error("pending outbound queue is full ({limit} messages)")]
    QueueFull { limit: usize },
    #[error("malformed {type_key} payload: {source}")]
    Payload {
        type_key: &'static str,
        source: EnvelopeError,
    },
    #[error(transparent)]
    Connection(ConnectionError),
}

impl From<ConnectionError> for ServiceError {
    fn from(value: ConnectionError) -> Self {
        match value {
            ConnectionError::NotConnected => Self::NotConnected,
            other => Self::Connection(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: &'static str, value: String },
}
