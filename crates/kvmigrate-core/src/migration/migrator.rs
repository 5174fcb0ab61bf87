//! Migration orchestration.
//!
//! Runs the registry against a store: checks persisted records, applies the
//! pending suffix one transaction per migration, and reverts on request.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, instrument, warn};

use super::error::{Direction, MigrationError};
use super::record::{MigrationRecord, MigrationRecordStore};
use super::registry::MigrationRegistry;
use super::Migration;
use crate::context::Context;
use crate::storage::Store;

/// Migrator configuration.
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Fail instead of warning when a recorded name differs from the
    /// declared one at the same position.
    pub verify_names: bool,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            verify_names: false,
        }
    }
}

impl MigratorConfig {
    /// Set whether recorded names must match declared names.
    pub fn with_verify_names(mut self, verify: bool) -> Self {
        self.verify_names = verify;
        self
    }
}

/// Where the migrator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigratorState {
    /// No run has started yet, or the last check failed.
    Uninitialized,
    /// Reading persisted records.
    Checking,
    /// Running `up` of the migration at this position.
    Applying(usize),
    /// Running `down` of the migration at this position.
    Reverting(usize),
    /// Every declared migration is applied.
    Applied,
    /// A rollback finished with this many migrations still applied.
    RolledBack(usize),
    /// The migration at this position failed; nothing of it was persisted.
    Failed(usize),
}

/// One migration run by [`Migrator::up`] or [`Migrator::down`].
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Position in the registry.
    pub index: usize,
    /// Migration name.
    pub name: String,
    /// Time spent in the step, commit included.
    pub elapsed: Duration,
}

/// Summary of a migrator run.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    /// Direction of the run.
    pub direction: Direction,
    /// Migrations applied before the run started.
    pub previously_applied: usize,
    /// Steps executed, in execution order.
    pub steps: Vec<StepOutcome>,
    /// Migrations applied after the run.
    pub applied_count: usize,
}

impl MigrationReport {
    /// Whether the run changed nothing.
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Declared migration paired with its record.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Position in the registry.
    pub index: usize,
    /// Declared name.
    pub name: String,
    /// Persisted record, if applied.
    pub record: Option<MigrationRecord>,
}

impl MigrationStatus {
    /// Whether the migration has been applied.
    pub fn is_applied(&self) -> bool {
        self.record.is_some()
    }
}

/// Applies a [`MigrationRegistry`] to a [`Store`].
///
/// Applied state is re-read from the store on every call, so a migrator can
/// be dropped and rebuilt at any point without losing track. Only one
/// migrator may run against a store at a time.
pub struct Migrator {
    store: Store,
    registry: MigrationRegistry,
    config: MigratorConfig,
    state: Mutex<MigratorState>,
}

impl Migrator {
    /// Create a migrator over a store handle.
    pub fn new(store: Store, registry: MigrationRegistry, config: MigratorConfig) -> Self {
        Self {
            store,
            registry,
            config,
            state: Mutex::new(MigratorState::Uninitialized),
        }
    }

    /// The store migrations run against.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The declared migrations.
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MigratorState {
        *self.state.lock()
    }

    /// Apply every migration not yet recorded, in declared order.
    ///
    /// When everything is applied already, this only reads.
    #[instrument(skip(self, ctx), fields(declared = self.registry.len()))]
    pub fn up(&self, ctx: &Context) -> Result<MigrationReport, MigrationError> {
        let records = self.check()?;
        let previously_applied = records.len();
        let declared = self.registry.len();

        if previously_applied == declared {
            self.set_state(MigratorState::Applied);
            info!(applied = declared, "migrations up to date");
            return Ok(MigrationReport {
                direction: Direction::Up,
                previously_applied,
                steps: Vec::new(),
                applied_count: declared,
            });
        }

        info!(
            applied = previously_applied,
            pending = declared - previously_applied,
            "applying migrations"
        );

        let mut steps = Vec::with_capacity(declared - previously_applied);
        for index in previously_applied..declared {
            let migration = &self.registry[index];
            self.set_state(MigratorState::Applying(index));

            let started = Instant::now();
            self.apply(ctx, index, migration)
                .map_err(|e| self.step_failed(index, migration, Direction::Up, e))?;
            let elapsed = started.elapsed();

            info!(
                index,
                name = migration.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "migration applied"
            );
            steps.push(StepOutcome {
                index,
                name: migration.name().to_string(),
                elapsed,
            });
        }

        self.set_state(MigratorState::Applied);
        Ok(MigrationReport {
            direction: Direction::Up,
            previously_applied,
            steps,
            applied_count: declared,
        })
    }

    /// Revert applied migrations down to `target`, which stays applied.
    ///
    /// Steps run from the highest applied position down to `target + 1`,
    /// each in its own transaction that also removes its record.
    #[instrument(skip(self, ctx), fields(declared = self.registry.len()))]
    pub fn down(&self, ctx: &Context, target: usize) -> Result<MigrationReport, MigrationError> {
        self.revert(ctx, Some(target))
    }

    /// Revert every applied migration.
    #[instrument(skip(self, ctx), fields(declared = self.registry.len()))]
    pub fn down_all(&self, ctx: &Context) -> Result<MigrationReport, MigrationError> {
        self.revert(ctx, None)
    }

    /// Every declared migration with its record, if applied.
    pub fn status(&self) -> Result<Vec<MigrationStatus>, MigrationError> {
        let records = self.store.view(|tx| MigrationRecordStore::list(tx))?;
        if records.len() > self.registry.len() {
            return Err(MigrationError::SequenceRegression {
                applied: records.len(),
                declared: self.registry.len(),
            });
        }

        let mut records = records.into_iter();
        Ok(self
            .registry
            .iter()
            .enumerate()
            .map(|(index, migration)| MigrationStatus {
                index,
                name: migration.name().to_string(),
                record: records.next(),
            })
            .collect())
    }

    /// Number of applied migrations.
    pub fn applied_count(&self) -> Result<usize, MigrationError> {
        self.store
            .view(|tx| MigrationRecordStore::applied_count(tx))
    }

    // ========== Internals ==========

    fn revert(
        &self,
        ctx: &Context,
        target: Option<usize>,
    ) -> Result<MigrationReport, MigrationError> {
        let records = self.check()?;
        let previously_applied = records.len();

        let keep = match target {
            Some(target) if target >= previously_applied => {
                self.set_state(MigratorState::Uninitialized);
                return Err(MigrationError::InvalidTarget {
                    target,
                    applied: previously_applied,
                });
            }
            Some(target) => target + 1,
            None => 0,
        };

        info!(
            applied = previously_applied,
            reverting = previously_applied - keep,
            "reverting migrations"
        );

        let mut steps = Vec::with_capacity(previously_applied - keep);
        for index in (keep..previously_applied).rev() {
            let migration = &self.registry[index];
            self.set_state(MigratorState::Reverting(index));

            let started = Instant::now();
            self.unapply(ctx, index, migration)
                .map_err(|e| self.step_failed(index, migration, Direction::Down, e))?;
            let elapsed = started.elapsed();

            info!(
                index,
                name = migration.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "migration reverted"
            );
            steps.push(StepOutcome {
                index,
                name: migration.name().to_string(),
                elapsed,
            });
        }

        self.set_state(MigratorState::RolledBack(keep));
        Ok(MigrationReport {
            direction: Direction::Down,
            previously_applied,
            steps,
            applied_count: keep,
        })
    }

    /// Read persisted records and validate them against the registry.
    fn check(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        self.set_state(MigratorState::Checking);
        let result = self
            .store
            .view(|tx| MigrationRecordStore::list(tx))
            .and_then(|records| self.validate(records));
        if result.is_err() {
            self.set_state(MigratorState::Uninitialized);
        }
        result
    }

    fn validate(&self, records: Vec<MigrationRecord>) -> Result<Vec<MigrationRecord>, MigrationError> {
        let declared = self.registry.len();
        if records.len() > declared {
            error!(applied = records.len(), declared, "sequence regression");
            return Err(MigrationError::SequenceRegression {
                applied: records.len(),
                declared,
            });
        }

        for (index, record) in records.iter().enumerate() {
            let name = self.registry[index].name();
            if record.name != name {
                if self.config.verify_names {
                    return Err(MigrationError::NameMismatch {
                        index,
                        recorded: record.name.clone(),
                        declared: name.to_string(),
                    });
                }
                warn!(
                    index,
                    recorded = %record.name,
                    declared = name,
                    "recorded migration name differs from declared name"
                );
            }
        }
        Ok(records)
    }

    /// Run `up` and record it in one transaction.
    fn apply(
        &self,
        ctx: &Context,
        index: usize,
        migration: &dyn Migration,
    ) -> Result<(), MigrationError> {
        ctx.check()?;
        self.store.update(|tx| {
            migration.up(ctx, tx)?;
            MigrationRecordStore::insert(tx, &MigrationRecord::new(index as u64, migration.name()))?;
            ctx.check()?;
            Ok(())
        })
    }

    /// Run `down` and remove its record in one transaction.
    fn unapply(
        &self,
        ctx: &Context,
        index: usize,
        migration: &dyn Migration,
    ) -> Result<(), MigrationError> {
        ctx.check()?;
        self.store.update(|tx| {
            migration.down(ctx, tx)?;
            MigrationRecordStore::remove(tx, index as u64)?;
            ctx.check()?;
            Ok(())
        })
    }

    fn step_failed(
        &self,
        index: usize,
        migration: &dyn Migration,
        direction: Direction,
        source: MigrationError,
    ) -> MigrationError {
        self.set_state(MigratorState::Failed(index));
        error!(
            index,
            name = migration.name(),
            %direction,
            error = %source,
            "migration failed"
        );
        MigrationError::Step {
            index,
            name: migration.name().to_string(),
            direction,
            source: Box::new(source),
        }
    }

    fn set_state(&self, state: MigratorState) {
        *self.state.lock() = state;
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
