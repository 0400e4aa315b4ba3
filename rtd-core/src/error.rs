//! Error types for the depth server

use thiserror::Error;

/// Server-wide error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtdError {
    /// Socket failure or closed connection. Triggers a reconnect, never
    /// surfaced to subscribers.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected frame. Logged and dropped.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Bad data point name, out of range level or malformed key.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Event for a symbol with no cached instrument or snapshot.
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RtdError {
    pub fn transport(msg: impl Into<String>) -> Self {
        RtdError::Transport(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        RtdError::Parse(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        RtdError::InvalidRequest(msg.into())
    }

    pub fn unknown_symbol(symbol: impl Into<String>) -> Self {
        RtdError::UnknownSymbol(symbol.into())
    }

    pub fn api(msg: impl Into<String>) -> Self {
        RtdError::Api(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        RtdError::Network(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        RtdError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RtdError::Internal(msg.into())
    }

    /// Whether this error is returned to the consumer rather than retried
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, RtdError::InvalidRequest(_))
    }
}

/// Result type alias for depth server operations
pub type RtdResult<T> = Result<T, RtdError>;
