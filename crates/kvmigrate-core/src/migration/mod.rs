//! Migration engine for kvmigrate.
//!
//! Applies an ordered registry of named migrations exactly once, tracks
//! what ran in the `migrations` bucket, and supports rollback.
//!
//! Each migration runs inside one write transaction together with the write
//! of its [`MigrationRecord`], so a step is either fully applied and recorded
//! or leaves no trace. Re-running [`Migrator::up`] after a failure resumes at
//! the first unrecorded migration.
//!
//! # Migration kinds
//!
//! | Kind | Type | Reversible |
//! |------|------|------------|
//! | Closure-based | [`FnMigration`] | only with an explicit `down` |
//! | Bucket bootstrap | [`BootstrapMigration`] | keeps its buckets unless built with `with_drop_on_down` |
//! | Index backfill | [`IndexMigration`] | disables the read path |
//!
//! # Example
//!
//! ```ignore
//! use kvmigrate_core::{
//!     BackfillConfig, BootstrapMigration, Context, IndexMigration, MigrationRegistry, Migrator,
//!     MigratorConfig,
//! };
//!
//! let registry = MigrationRegistry::builder()
//!     .add(BootstrapMigration::new("initial buckets", ["users", "orgs"]))
//!     .add(IndexMigration::new("users by email", index, BackfillConfig::default()))
//!     .build()?;
//!
//! let migrator = Migrator::new(store.clone(), registry, MigratorConfig::default());
//! migrator.up(&Context::background())?;
//! ```

pub mod backfill;
pub mod bootstrap;
pub mod error;
pub mod func;
pub mod migrator;
pub mod record;
pub mod registry;

use crate::context::Context;
use crate::storage::Tx;

// Error types
pub use error::{Direction, MigrationError};

// Record types
pub use record::{MigrationRecord, MigrationRecordStore};

// Registry
pub use registry::{MigrationRegistry, MigrationRegistryBuilder};

// Migration kinds
pub use backfill::{BackfillConfig, BackfillProgress, IndexMigration};
pub use bootstrap::BootstrapMigration;
pub use func::FnMigration;

// Orchestration
pub use migrator::{
    MigrationReport, MigrationStatus, Migrator, MigratorConfig, MigratorState, StepOutcome,
};

/// A named unit of forward and backward schema work.
///
/// Both directions run inside the transaction they are handed; the migrator
/// commits it together with the bookkeeping record. If the transaction
/// aborts before commit the step may be retried from scratch, so
/// implementations must not rely on state outside the store.
pub trait Migration: Send + Sync {
    /// Stable identifier, unique within its registry.
    fn name(&self) -> &str;

    /// Apply the migration.
    fn up(&self, ctx: &Context, tx: &mut Tx<'_>) -> Result<(), MigrationError>;

    /// Reverse [`Migration::up`].
    ///
    /// Migrations that cannot be reversed return
    /// [`MigrationError::Irreversible`].
    fn down(&self, ctx: &Context, tx: &mut Tx<'_>) -> Result<(), MigrationError>;
}
