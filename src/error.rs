//! Error types for the synchronization layer.

use thiserror::Error;

/// Main error type for synchronization operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Provider initialization failed: {0}")]
    ProviderInit(String),

    #[error("Delivery error on {path}: {message}")]
    Delivery { path: String, message: String },

    #[error("Decode error for record {record}: {message}")]
    Decode { record: String, message: String },

    #[error("Snapshot shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Listen failed: {0}")]
    ListenFailed(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Build a decode error for the record with the given identifier.
    pub fn decode(record: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Decode {
            record: record.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::InvalidConfig(e.to_string())
    }
}

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;
