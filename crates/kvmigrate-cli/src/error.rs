//! CLI error types.

use thiserror::Error;

/// CLI errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] kvmigrate_core::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(#[from] kvmigrate_core::MigrationError),

    /// Writing command output failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The index does not mirror its source bucket.
    #[error("index {index} is inconsistent: {missing} missing, {orphaned} orphaned, {stale} stale")]
    IndexInconsistent {
        /// Index name.
        index: String,
        /// Entries the index lacks.
        missing: usize,
        /// Entries without a backing record.
        orphaned: usize,
        /// Entries with an outdated payload.
        stale: usize,
    },
}
