//! Migration-specific error types.

use std::fmt;

use thiserror::Error;

/// Which way a migration step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Forward (`up`).
    Up,
    /// Backward (`down`).
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Store transaction or I/O failure.
    #[error("store error: {0}")]
    Store(#[from] crate::error::Error),

    /// More migrations are recorded than declared.
    ///
    /// The persisted state belongs to a newer build; never auto-corrected.
    #[error("{applied} migrations applied but only {declared} declared")]
    SequenceRegression {
        /// Number of persisted records.
        applied: usize,
        /// Number of declared migrations.
        declared: usize,
    },

    /// A single migration step failed and its transaction was aborted.
    #[error("migration {index} ({name}) failed during {direction}: {source}")]
    Step {
        /// Position of the migration in the registry.
        index: usize,
        /// Migration name.
        name: String,
        /// Direction that failed.
        direction: Direction,
        /// Underlying failure.
        #[source]
        source: Box<MigrationError>,
    },

    /// The migration cannot be reversed.
    #[error("migration {name} is irreversible")]
    Irreversible {
        /// Migration name.
        name: String,
    },

    /// Two declared migrations share a name.
    #[error("duplicate migration name: {name}")]
    DuplicateName {
        /// The repeated name.
        name: String,
    },

    /// The recorded name at a position differs from the declared one.
    #[error("migration {index} recorded as {recorded} but declared as {declared}")]
    NameMismatch {
        /// Position in the registry.
        index: usize,
        /// Name stored in the record.
        recorded: String,
        /// Name in the registry.
        declared: String,
    },

    /// Persisted migration records are inconsistent.
    #[error("migration state corrupted: {message}")]
    StateCorrupted {
        /// Description of the corruption.
        message: String,
    },

    /// A rollback target beyond the applied migrations.
    #[error("cannot roll back to {target}: only {applied} migrations applied")]
    InvalidTarget {
        /// Requested target index.
        target: usize,
        /// Number of applied migrations.
        applied: usize,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl MigrationError {
    /// The store error at the bottom of a chain of step failures, if any.
    pub fn store_error(&self) -> Option<&crate::error::Error> {
        match self {
            MigrationError::Store(e) => Some(e),
            MigrationError::Step { source, .. } => source.store_error(),
            _ => None,
        }
    }

    /// Whether the run stopped because its context was cancelled or expired.
    pub fn is_cancellation(&self) -> bool {
        self.store_error().is_some_and(|e| e.is_cancellation())
    }

    /// Position of the failed step, if the error came from one.
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            MigrationError::Step { index, .. } => Some(*index),
            _ => None,
        }
    }
}
