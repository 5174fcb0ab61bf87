//! Ordered, immutable migration registry.

use std::collections::HashSet;
use std::ops::Index;

use super::error::MigrationError;
use super::Migration;

/// The declared migrations, in application order.
///
/// Positions are the migrations' identities: new migrations are appended,
/// never inserted or reordered.
pub struct MigrationRegistry {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRegistry {
    /// Start building a registry.
    pub fn builder() -> MigrationRegistryBuilder {
        MigrationRegistryBuilder::default()
    }

    /// Number of declared migrations.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Whether no migrations are declared.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// The migration at `index`.
    pub fn get(&self, index: usize) -> Option<&dyn Migration> {
        self.migrations.get(index).map(|m| m.as_ref())
    }

    /// Iterate migrations in order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Migration> {
        self.migrations.iter().map(|m| m.as_ref())
    }

    /// Declared names in order.
    pub fn names(&self) -> Vec<&str> {
        self.iter().map(|m| m.name()).collect()
    }
}

impl Index<usize> for MigrationRegistry {
    type Output = dyn Migration;

    fn index(&self, index: usize) -> &Self::Output {
        self.migrations[index].as_ref()
    }
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Builder for [`MigrationRegistry`].
#[derive(Default)]
pub struct MigrationRegistryBuilder {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRegistryBuilder {
    /// Append a migration.
    pub fn add<M: Migration + 'static>(mut self, migration: M) -> Self {
        self.migrations.push(Box::new(migration));
        self
    }

    /// Append an already boxed migration.
    pub fn add_boxed(mut self, migration: Box<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Finish the registry, rejecting duplicate names.
    pub fn build(self) -> Result<MigrationRegistry, MigrationError> {
        let mut seen = HashSet::new();
        for migration in &self.migrations {
            if !seen.insert(migration.name()) {
                return Err(MigrationError::DuplicateName {
                    name: migration.name().to_string(),
                });
            }
        }
        Ok(MigrationRegistry {
            migrations: self.migrations,
        })
    }
}
