//! Error types for canvas storage.

use pixelboard_protocol::CodecError;
use thiserror::Error;

/// Backend and storage errors.
///
/// Any of these aborts the operation in flight. Nothing in this crate retries.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The Redis server rejected a command or the connection failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored value could not be decoded.
    #[error("Corrupt value at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: CodecError,
    },

    /// A stored value has the wrong shape.
    #[error("Unexpected value at {key}: {reason}")]
    Unexpected { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
