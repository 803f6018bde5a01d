//! Client error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the relay client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("not connected to relay")]
    NotConnected,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("relay rejected event: {0}")]
    PublishRejected(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
