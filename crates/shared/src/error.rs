use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    NotFound,
    Validation,
    PayloadTooLarge,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A frame on the persistent connection that could not be turned into an envelope.
///
/// These are logged and dropped where they are detected; they are never sent to
/// either party.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid envelope json: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope `{kind}` is missing required field `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("unsupported frame type: {0}")]
    UnsupportedFrame(&'static str),
}
