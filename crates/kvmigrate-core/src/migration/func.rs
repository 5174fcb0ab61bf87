//! Closure-based migrations.

use super::error::MigrationError;
use super::Migration;
use crate::context::Context;
use crate::storage::Tx;

type StepFn = dyn Fn(&Context, &mut Tx<'_>) -> Result<(), MigrationError> + Send + Sync;

/// A migration built from closures.
///
/// Without a `down` closure the migration is irreversible.
pub struct FnMigration {
    name: String,
    up: Box<StepFn>,
    down: Option<Box<StepFn>>,
}

impl FnMigration {
    /// Create a migration from its forward step.
    pub fn new<U>(name: impl Into<String>, up: U) -> Self
    where
        U: Fn(&Context, &mut Tx<'_>) -> Result<(), MigrationError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            up: Box::new(up),
            down: None,
        }
    }

    /// Attach a backward step.
    pub fn with_down<D>(mut self, down: D) -> Self
    where
        D: Fn(&Context, &mut Tx<'_>) -> Result<(), MigrationError> + Send + Sync + 'static,
    {
        self.down = Some(Box::new(down));
        self
    }

    /// Whether a backward step is attached.
    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }
}

impl Migration for FnMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn up(&self, ctx: &Context, tx: &mut Tx<'_>) -> Result<(), MigrationError> {
        (self.up)(ctx, tx)
    }

    fn down(&self, ctx: &Context, tx: &mut Tx<'_>) -> Result<(), MigrationError> {
        match &self.down {
            Some(down) => down(ctx, tx),
            None => Err(MigrationError::Irreversible {
                name: self.name.clone(),
            }),
        }
    }
}

impl std::fmt::Debug for FnMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnMigration")
            .field("name", &self.name)
            .field("reversible", &self.is_reversible())
            .finish()
    }
}
