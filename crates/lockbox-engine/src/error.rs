use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported by the engine.
///
/// Messages are deliberately generic: a caller can tell which operation
/// failed, never why the cryptography rejected it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyError {
    #[error("No key-encryption key is provisioned")]
    NoKek,

    #[error("Content key for this store is not available")]
    NoCek,

    #[error("Device keys could not be imported")]
    Import,

    #[error("No device keys to export")]
    Export,

    #[error("Key envelope could not be opened")]
    Unwrap,

    #[error("Record could not be decrypted")]
    Decrypt,

    #[error("Record could not be encrypted")]
    Encrypt,

    #[error("Content key could not be rewrapped")]
    Rewrap,

    #[error("Key-encryption key rejected")]
    InvalidKek,

    #[error("Internal engine failure")]
    Internal,
}

/// Caller-side failures of the message channel itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Engine failed to start: {0}")]
    Spawn(String),

    #[error("Engine channel closed")]
    Closed,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(&'static str),
}

/// Everything an [`crate::EngineClient`] call can fail with.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Row conversion failed: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ClientError {
    /// The engine-side error, if the engine answered.
    pub fn key_error(&self) -> Option<KeyError> {
        match self {
            ClientError::Key(e) => Some(*e),
            _ => None,
        }
    }
}
