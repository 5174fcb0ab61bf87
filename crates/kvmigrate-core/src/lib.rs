//! kvmigrate core - bucket store, migration engine, and live index backfill.
//!
//! This crate provides a transactional store of named buckets over sled,
//! secondary indexes with a gated read path, and a migrator that applies an
//! ordered registry of migrations exactly once.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod context;
pub mod error;
pub mod index;
pub mod migration;
pub mod storage;

pub use context::Context;
pub use error::Error;
pub use index::{EntryCheck, Index, IndexDiff, IndexEntry, IndexMapping, IndexedValue};
pub use migration::{
    BackfillConfig, BackfillProgress, BootstrapMigration, Direction, FnMigration, IndexMigration,
    Migration, MigrationError, MigrationRecord, MigrationRegistry, MigrationReport,
    MigrationStatus, Migrator, MigratorConfig, MigratorState,
};
pub use storage::{StorageConfig, Store, StoreStatsSnapshot, Tx};
