use shared::error::ErrorCode;
use thiserror::Error;

use crate::call::CallError;

#[derive(Debug, Error)]
pub enum TransportError {
    /// No live connection; sends are rejected instead of queued.
    #[error("not connected to the server")]
    NotConnected,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("server_url must start with http:// or https://: {0}")]
    InvalidUrl(String),
    #[error("failed to connect websocket: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request ({code:?}): {message}")]
    Api { code: ErrorCode, message: String },
    #[error("{0}")]
    Invalid(String),
}
