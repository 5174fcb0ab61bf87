//! Bucket store implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sled::{Db, Tree};

use super::{StorageConfig, Tx};
use crate::error::Error;

/// Tree holding the names of every created bucket.
pub(crate) const BUCKET_REGISTRY_TREE: &str = "meta:buckets";

/// Prefix for the sled tree backing each bucket.
const BUCKET_TREE_PREFIX: &str = "bucket:";

/// Commit counters for a store.
#[derive(Debug, Default)]
pub struct StoreStats {
    commits: AtomicU64,
    writes: AtomicU64,
    conflicts: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStatsSnapshot {
    /// Transactions committed with at least one write.
    pub commits: u64,
    /// Individual key writes and deletes applied by those commits.
    pub writes: u64,
    /// Commits aborted because an observed value changed.
    pub conflicts: u64,
    /// Flushes issued after commits by a store with sync writes.
    pub flushes: u64,
}

impl StoreStats {
    pub(crate) fn record_commit(&self, writes: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.writes.fetch_add(writes, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

/// A transactional store of named buckets backed by sled.
///
/// Cloning is cheap: clones share the same database handle and counters.
#[derive(Clone)]
pub struct Store {
    /// The underlying sled database.
    db: Db,

    /// Registry of created buckets (bucket name -> empty).
    registry: Tree,

    stats: Arc<StoreStats>,

    sync_writes: bool,
}

impl Store {
    /// Open or create a store with the given configuration.
    pub fn open(config: StorageConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let mut store = Self::from_db(db)?;
        store.sync_writes = config.sync_writes;
        Ok(store)
    }

    /// Wrap an already opened sled database.
    pub fn from_db(db: Db) -> Result<Self, Error> {
        let registry = db.open_tree(BUCKET_REGISTRY_TREE)?;
        Ok(Self {
            db,
            registry,
            stats: Arc::new(StoreStats::default()),
            sync_writes: false,
        })
    }

    /// Check if the database was recovered from a previous crash.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }

    /// Begin a read-only transaction.
    pub fn begin_read(&self) -> Tx<'_> {
        Tx::new(self, false)
    }

    /// Begin a read-write transaction.
    pub fn begin_write(&self) -> Tx<'_> {
        Tx::new(self, true)
    }

    /// Run `f` inside a read-only transaction.
    pub fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T, E>,
    {
        let mut tx = self.begin_read();
        f(&mut tx)
    }

    /// Run `f` inside a read-write transaction.
    ///
    /// The transaction commits if `f` returns `Ok`, and is discarded otherwise.
    pub fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T, E>,
        E: From<Error>,
    {
        let mut tx = self.begin_write();
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    /// List the names of all created buckets.
    pub fn bucket_names(&self) -> Result<Vec<String>, Error> {
        self.registry
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                String::from_utf8(key.to_vec()).map_err(|_| Error::InvalidKey)
            })
            .collect()
    }

    /// Snapshot the commit counters.
    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    /// Whether every commit is flushed before it returns.
    pub fn syncs_writes(&self) -> bool {
        self.sync_writes
    }

    /// Get database size in bytes.
    pub fn size_on_disk(&self) -> Result<u64, Error> {
        Ok(self.db.size_on_disk()?)
    }

    /// Open the sled tree with the given name.
    pub(crate) fn tree(&self, tree_name: &str) -> Result<Tree, Error> {
        if tree_name == BUCKET_REGISTRY_TREE {
            return Ok(self.registry.clone());
        }
        Ok(self.db.open_tree(tree_name)?)
    }

    pub(crate) fn stats_handle(&self) -> &StoreStats {
        &self.stats
    }
}

/// Name of the sled tree backing a bucket.
pub(crate) fn bucket_tree_name(bucket: &str) -> String {
    format!("{}{}", BUCKET_TREE_PREFIX, bucket)
}

/// Bucket name for a tree name, for error messages.
pub(crate) fn display_tree_name(tree_name: &str) -> &str {
    tree_name.strip_prefix(BUCKET_TREE_PREFIX).unwrap_or(tree_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        Store::open(StorageConfig::temporary()).unwrap()
    }

    #[test]
    fn test_update_commits_on_ok() {
        let store = test_store();

        store
            .update(|tx| -> Result<(), Error> {
                tx.create_bucket("users")?;
                tx.put("users", b"u1", b"alice")
            })
            .unwrap();

        let value = store
            .view(|tx| tx.get("users", b"u1"))
            .unwrap();
        assert_eq!(value.as_deref(), Some(&b"alice"[..]));
        assert_eq!(store.bucket_names().unwrap(), vec!["users".to_string()]);
    }

    #[test]
    fn test_update_discards_on_err() {
        let store = test_store();

        let result: Result<(), Error> = store.update(|tx| {
            tx.create_bucket("users")?;
            tx.put("users", b"u1", b"alice")?;
            Err(Error::InvalidData("boom".to_string()))
        });
        assert!(result.is_err());

        let exists = store.view(|tx| tx.bucket_exists("users")).unwrap();
        assert!(!exists);
        assert_eq!(store.stats().commits, 0);
    }

    #[test]
    fn test_stats_count_writes() {
        let store = test_store();

        store
            .update(|tx| -> Result<(), Error> {
                tx.create_bucket("users")?;
                tx.put("users", b"u1", b"a")?;
                tx.put("users", b"u2", b"b")
            })
            .unwrap();

        // registry entry + two puts
        let stats = store.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.writes, 3);

        // reads never count
        store.view(|tx| tx.get("users", b"u1")).unwrap();
        assert_eq!(store.stats(), stats);
    }

    #[test]
    fn test_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::new(dir.path());

        {
            let store = Store::open(config.clone()).unwrap();
            store
                .update(|tx| -> Result<(), Error> {
                    tx.create_bucket("users")?;
                    tx.put("users", b"u1", b"alice")
                })
                .unwrap();
            store.flush().unwrap();
        }

        {
            let store = Store::open(config).unwrap();
            let value = store.view(|tx| tx.get("users", b"u1")).unwrap();
            assert_eq!(value.as_deref(), Some(&b"alice"[..]));
        }
    }

    #[test]
    fn test_sync_writes_flush_each_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StorageConfig::new(dir.path()).with_sync_writes()).unwrap();
        assert!(store.syncs_writes());

        for key in [b"u1", b"u2"] {
            store
                .update(|tx| -> Result<(), Error> {
                    tx.create_bucket("users")?;
                    tx.put("users", key, b"x")
                })
                .unwrap();
        }
        // empty commits are not flushed
        store.update(|tx| tx.get("users", b"u1")).unwrap();
        assert_eq!(store.stats().flushes, 2);

        let lazy = test_store();
        lazy.update(|tx| tx.create_bucket("users")).unwrap();
        assert_eq!(lazy.stats().flushes, 0);
    }

    #[test]
    fn test_tree_names() {
        assert_eq!(bucket_tree_name("users"), "bucket:users");
        assert_eq!(display_tree_name("bucket:users"), "users");
        assert_eq!(display_tree_name(BUCKET_REGISTRY_TREE), BUCKET_REGISTRY_TREE);
    }
}
