//! Bucket bootstrap migration.

use tracing::debug;

use super::error::MigrationError;
use super::Migration;
use crate::context::Context;
use crate::storage::Tx;

/// Creates a declared set of buckets and optionally seeds them.
///
/// Creating a bucket that already exists is a no-op, so the migration can
/// adopt stores whose buckets predate migration tracking. `down` only
/// forgets the migration; the buckets and their data stay unless
/// [`BootstrapMigration::with_drop_on_down`] was set.
#[derive(Debug, Clone)]
pub struct BootstrapMigration {
    name: String,
    buckets: Vec<String>,
    seed: Vec<(String, Vec<u8>, Vec<u8>)>,
    drop_on_down: bool,
}

impl BootstrapMigration {
    /// Create a bootstrap migration for the given buckets.
    pub fn new<I, S>(name: impl Into<String>, buckets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            buckets: buckets.into_iter().map(Into::into).collect(),
            seed: Vec::new(),
            drop_on_down: false,
        }
    }

    /// Drop every declared bucket, contents included, when reverted.
    pub fn with_drop_on_down(mut self) -> Self {
        self.drop_on_down = true;
        self
    }

    /// Seed an entry, written only if the key is absent.
    pub fn with_seed(
        mut self,
        bucket: impl Into<String>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.seed.push((bucket.into(), key.into(), value.into()));
        self
    }

    /// Declared bucket names.
    pub fn buckets(&self) -> &[String] {
        &self.buckets
    }
}

impl Migration for BootstrapMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn up(&self, ctx: &Context, tx: &mut Tx<'_>) -> Result<(), MigrationError> {
        ctx.check()?;
        for bucket in &self.buckets {
            if tx.create_bucket(bucket)? {
                debug!(bucket = %bucket, "bucket created");
            }
        }
        for (bucket, key, value) in &self.seed {
            if !tx.contains(bucket, key)? {
                tx.put(bucket, key, value)?;
            }
        }
        Ok(())
    }

    fn down(&self, ctx: &Context, tx: &mut Tx<'_>) -> Result<(), MigrationError> {
        ctx.check()?;
        if !self.drop_on_down {
            debug!(migration = %self.name, "bootstrap reverted, buckets kept");
            return Ok(());
        }
        for bucket in self.buckets.iter().rev() {
            if tx.bucket_exists(bucket)? {
                tx.delete_bucket(bucket)?;
                debug!(bucket = %bucket, "bucket dropped");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageConfig, Store};

    #[test]
    fn test_creates_and_drops_buckets() {
        let store = Store::open(StorageConfig::temporary()).unwrap();
        let ctx = Context::background();
        let migration = BootstrapMigration::new("initial", ["users", "orgs"])
            .with_seed("orgs", b"default".to_vec(), b"{}".to_vec())
            .with_drop_on_down();

        store.update(|tx| migration.up(&ctx, tx)).unwrap();
        assert_eq!(
            store.bucket_names().unwrap(),
            vec!["orgs".to_string(), "users".to_string()]
        );
        let seeded = store.view(|tx| tx.get("orgs", b"default")).unwrap();
        assert_eq!(seeded.as_deref(), Some(&b"{}"[..]));

        store.update(|tx| migration.down(&ctx, tx)).unwrap();
        assert!(store.bucket_names().unwrap().is_empty());
    }

    #[test]
    fn test_down_keeps_buckets_by_default() {
        let store = Store::open(StorageConfig::temporary()).unwrap();
        let ctx = Context::background();
        let migration = BootstrapMigration::new("initial", ["users"]);

        store.update(|tx| migration.up(&ctx, tx)).unwrap();
        store.update(|tx| tx.put("users", b"u1", b"alice")).unwrap();
        store.update(|tx| migration.down(&ctx, tx)).unwrap();

        let value = store.view(|tx| tx.get("users", b"u1")).unwrap();
        assert_eq!(value.as_deref(), Some(&b"alice"[..]));
    }

    #[test]
    fn test_existing_data_untouched() {
        let store = Store::open(StorageConfig::temporary()).unwrap();
        let ctx = Context::background();
        store
            .update(|tx| -> Result<(), crate::error::Error> {
                tx.create_bucket("orgs")?;
                tx.put("orgs", b"default", b"custom")
            })
            .unwrap();

        let migration = BootstrapMigration::new("initial", ["orgs"])
            .with_seed("orgs", b"default".to_vec(), b"{}".to_vec());
        store.update(|tx| migration.up(&ctx, tx)).unwrap();

        let value = store.view(|tx| tx.get("orgs", b"default")).unwrap();
        assert_eq!(value.as_deref(), Some(&b"custom"[..]));
    }
}
