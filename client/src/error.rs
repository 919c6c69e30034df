//! Unified error handling for the client runtime.

use crate::config::ConfigError;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Engine error: {0}")]
    Engine(#[from] livesync_engine::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Record already exists: {0}")]
    RecordExists(String),

    #[error("Source rejected request: {0}")]
    Rejected(String),

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Session closed")]
    Closed,
}

/// Result type alias for the client runtime.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ClientError::Rejected("unknown collection".into());
        assert_eq!(err.to_string(), "Source rejected request: unknown collection");

        let err = ClientError::from(livesync_engine::Error::InvalidCollection("".into()));
        assert_eq!(err.to_string(), "Engine error: invalid collection name: \"\"");

        let err = ClientError::Timeout(std::time::Duration::from_millis(250));
        assert_eq!(err.to_string(), "Timed out after 250ms");
    }
}
