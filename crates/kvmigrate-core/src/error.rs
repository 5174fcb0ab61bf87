//! Core error types.

use thiserror::Error;

/// Store and index errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Key decoding error.
    #[error("invalid key format")]
    InvalidKey,

    /// The named bucket has not been created.
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    /// A write was attempted through a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// A value observed by the transaction changed before commit.
    #[error("transaction conflict in {bucket} on key {key}")]
    TransactionConflict {
        /// Bucket (or reserved tree) holding the key.
        bucket: String,
        /// Hex-encoded key.
        key: String,
    },

    /// The index read path has not been enabled yet.
    #[error("index {index} is not ready for reads")]
    IndexNotReady {
        /// Index name.
        index: String,
    },

    /// The operation was cancelled through its context.
    #[error("operation cancelled")]
    Cancelled,

    /// The context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Whether retrying the same transaction may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::TransactionConflict { .. })
    }

    /// Whether the error came from the caller's context.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}
