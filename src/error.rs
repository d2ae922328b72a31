//! Error types for the subscription engine.

use crate::types::SubscriptionId;
use thiserror::Error;

/// Main error type for store, registry and pub/sub operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Subscription not found: {0}")]
    NotFound(SubscriptionId),

    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("Subscription id mismatch: path {path}, body {body}")]
    IdMismatch { path: SubscriptionId, body: String },

    #[error("Operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store log entry of {len} bytes exceeds the {max} byte limit")]
    EntryTooLarge { len: usize, max: usize },

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Timed out waiting for a published message")]
    ReceiveTimeout,

    #[error("Pub/sub connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not subscribed to any channel")]
    NotSubscribed,

    #[error("Notification transport error: {0}")]
    Transport(String),
}

impl EngineError {
    /// True for the "lookup legitimately found nothing" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    /// HTTP status the routing layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::InvalidSubscription(_) | EngineError::IdMismatch { .. } => 400,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            EngineError::Deserialization(e.to_string())
        } else {
            EngineError::Serialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EngineError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
