//! CLI configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kvmigrate_core::{BackfillConfig, MigratorConfig, StorageConfig};

/// Default number of records per backfill chunk.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default conflict retries per backfill chunk.
pub const DEFAULT_CONFLICT_RETRIES: usize = 8;

/// Default sled cache size in megabytes.
pub const DEFAULT_CACHE_MB: u64 = 256;

/// What to do with the store.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Apply every pending migration.
    Up,
    /// Revert migrations applied after `--target`.
    Down {
        /// Index of the last migration to keep.
        #[arg(long)]
        target: usize,
    },
    /// List declared migrations and when they were applied.
    Status,
    /// Compare the user resource mapping index against its source bucket.
    VerifyIndex,
}

/// Resolved configuration for one CLI run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store location and tuning.
    pub storage: StorageConfig,
    /// Migrator behaviour.
    pub migrator: MigratorConfig,
    /// Backfill tuning for index migrations.
    pub backfill: BackfillConfig,
    /// Deadline for the whole run. None waits indefinitely.
    pub timeout: Option<Duration>,
    /// The command to run.
    pub command: Command,
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "kvmigrate")]
#[command(version, about = "Metadata store migration runner", long_about = None)]
pub struct Args {
    /// Path to the store directory.
    #[arg(short, long, default_value = "./data", global = true)]
    pub data_path: PathBuf,

    /// Records per backfill chunk transaction.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, global = true)]
    pub batch_size: usize,

    /// Conflicting commits tolerated per backfill chunk.
    #[arg(long, default_value_t = DEFAULT_CONFLICT_RETRIES, global = true)]
    pub conflict_retries: usize,

    /// Deadline for the run in seconds. Set to 0 to disable.
    #[arg(long, default_value_t = 0, global = true)]
    pub timeout: u64,

    /// Fail when a recorded migration name differs from the declared one.
    #[arg(long, global = true)]
    pub strict_names: bool,

    /// Store cache size in megabytes.
    #[arg(long, default_value_t = DEFAULT_CACHE_MB, global = true)]
    pub cache_mb: u64,

    /// Flush the store after every commit.
    #[arg(long, global = true)]
    pub sync_writes: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    /// Convert command-line arguments to a run configuration.
    pub fn into_config(self) -> Config {
        let mut storage = StorageConfig::new(self.data_path)
            .with_cache_capacity(self.cache_mb * 1024 * 1024);
        if self.sync_writes {
            storage = storage.with_sync_writes();
        }

        let timeout = if self.timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout))
        };

        Config {
            storage,
            migrator: MigratorConfig::default().with_verify_names(self.strict_names),
            backfill: BackfillConfig::default()
                .with_batch_size(self.batch_size)
                .with_max_conflict_retries(self.conflict_retries),
            timeout,
            command: self.command,
        }
    }
}
