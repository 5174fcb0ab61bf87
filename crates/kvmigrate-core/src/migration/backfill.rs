//! Live index backfill.
//!
//! Builds an [`Index`] over an existing source bucket while writers keep
//! running. The source is scanned in bounded chunks, each written by its own
//! short transaction; writes that land behind the scan cursor reach the
//! index through dual-write. The read path only flips once every chunk (and
//! the optional cleanup pass) has committed, and the flip commits together
//! with the migration record.
//!
//! Every chunk re-validates the records it read when it commits. A writer
//! that changes or deletes a scanned record in between makes the chunk abort
//! with a conflict, and the chunk is retried against fresh data.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::error::MigrationError;
use super::Migration;
use crate::context::Context;
use crate::error::Error;
use crate::index::{EntryCheck, Index, IndexEntry};
use crate::storage::{Store, Tx};

/// Configuration for backfill execution.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Number of records per chunk transaction.
    pub batch_size: usize,
    /// Conflicting commits tolerated per chunk before giving up.
    pub max_conflict_retries: usize,
    /// Remove orphaned and rewrite stale index entries after the scan.
    pub cleanup: bool,
    /// Delete every index entry when the migration is reverted.
    pub clear_on_down: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_conflict_retries: 8,
            cleanup: false,
            clear_on_down: true,
        }
    }
}

impl BackfillConfig {
    /// Set the chunk size. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the per-chunk conflict retry budget.
    pub fn with_max_conflict_retries(mut self, retries: usize) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Enable or disable the cleanup pass.
    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Set whether reverting clears the index.
    pub fn with_clear_on_down(mut self, clear: bool) -> Self {
        self.clear_on_down = clear;
        self
    }
}

/// Progress report for a backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillProgress {
    /// Source records read.
    pub scanned: u64,
    /// Index entries written by the scan.
    pub indexed: u64,
    /// Chunk transactions committed.
    pub chunks: u64,
    /// Chunk commits retried after a conflict.
    pub conflicts: u64,
    /// Index entries examined by cleanup.
    pub checked: u64,
    /// Orphaned entries removed by cleanup.
    pub removed: u64,
    /// Stale entries rewritten by cleanup.
    pub rewritten: u64,
}

/// Called after every committed scan chunk with the store and progress so far.
pub type BatchHook = dyn Fn(&Store, &BackfillProgress) + Send + Sync;

/// What a single chunk transaction did.
#[derive(Debug, Default)]
struct ChunkOutcome {
    read: usize,
    written: u64,
    removed: u64,
    rewritten: u64,
    last_key: Option<Vec<u8>>,
}

/// A migration that populates an index from its source bucket.
pub struct IndexMigration {
    name: String,
    index: Index,
    config: BackfillConfig,
    hook: Option<Arc<BatchHook>>,
    last_progress: Mutex<Option<BackfillProgress>>,
}

impl IndexMigration {
    /// Create a backfill migration for `index`.
    ///
    /// A zero batch size is raised to one; an empty first chunk would
    /// otherwise end the scan and enable an empty index.
    pub fn new(name: impl Into<String>, index: Index, config: BackfillConfig) -> Self {
        let config = BackfillConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        Self {
            name: name.into(),
            index,
            config,
            hook: None,
            last_progress: Mutex::new(None),
        }
    }

    /// Install a hook run after every committed scan chunk.
    pub fn with_batch_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Store, &BackfillProgress) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// The index being built.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Backfill configuration.
    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    /// Progress of the most recent `up`, committed or not.
    pub fn last_progress(&self) -> Option<BackfillProgress> {
        self.last_progress.lock().clone()
    }

    /// Scan the source bucket and write every mapped entry.
    fn backfill(
        &self,
        ctx: &Context,
        store: &Store,
        progress: &mut BackfillProgress,
    ) -> Result<(), MigrationError> {
        let source = self.index.mapping().source_bucket();
        let mut cursor: Option<Vec<u8>> = None;

        loop {
            ctx.check()?;
            let outcome = self.run_chunk(store, progress, |tx| {
                self.scan_chunk(tx, cursor.as_deref())
            })?;

            progress.scanned += outcome.read as u64;
            progress.indexed += outcome.written;
            progress.chunks += 1;
            debug!(
                index = self.index.name(),
                source,
                read = outcome.read,
                indexed = outcome.written,
                total = progress.scanned,
                "backfill chunk committed"
            );

            if let Some(hook) = &self.hook {
                hook(store, progress);
            }

            match outcome.last_key {
                Some(key) if outcome.read >= self.config.batch_size => cursor = Some(key),
                _ => return Ok(()),
            }
        }
    }

    fn scan_chunk(&self, tx: &mut Tx<'_>, after: Option<&[u8]>) -> Result<ChunkOutcome, Error> {
        let source = self.index.mapping().source_bucket();
        if !tx.bucket_exists(source)? {
            return Ok(ChunkOutcome::default());
        }

        let page = tx.scan(source, after, self.config.batch_size)?;
        let mut outcome = ChunkOutcome {
            read: page.len(),
            ..ChunkOutcome::default()
        };
        for (primary_key, value) in &page {
            if self.index.put(tx, primary_key, value)? {
                outcome.written += 1;
            }
        }
        outcome.last_key = page.into_iter().last().map(|(key, _)| key);
        Ok(outcome)
    }

    /// Walk the index and drop entries no primary record backs any more.
    fn cleanup(
        &self,
        ctx: &Context,
        store: &Store,
        progress: &mut BackfillProgress,
    ) -> Result<(), MigrationError> {
        let mut cursor: Option<Vec<u8>> = None;

        loop {
            ctx.check()?;
            let outcome = self.run_chunk(store, progress, |tx| {
                self.cleanup_chunk(tx, cursor.as_deref())
            })?;

            progress.checked += outcome.read as u64;
            progress.removed += outcome.removed;
            progress.rewritten += outcome.rewritten;
            debug!(
                index = self.index.name(),
                checked = outcome.read,
                removed = outcome.removed,
                rewritten = outcome.rewritten,
                "cleanup chunk committed"
            );

            match outcome.last_key {
                Some(key) if outcome.read >= self.config.batch_size => cursor = Some(key),
                _ => return Ok(()),
            }
        }
    }

    fn cleanup_chunk(&self, tx: &mut Tx<'_>, after: Option<&[u8]>) -> Result<ChunkOutcome, Error> {
        let bucket = self.index.mapping().index_bucket();
        let page = tx.scan(bucket, after, self.config.batch_size)?;
        let mut outcome = ChunkOutcome {
            read: page.len(),
            ..ChunkOutcome::default()
        };

        for (key, payload) in page {
            let entry = IndexEntry::from_storage(&key, payload)?;
            match self.index.check_entry(tx, &entry)? {
                EntryCheck::Valid => {}
                EntryCheck::Orphaned => {
                    tx.delete(bucket, &key)?;
                    outcome.removed += 1;
                }
                EntryCheck::Stale { payload } => {
                    tx.put(bucket, &key, payload)?;
                    outcome.rewritten += 1;
                }
            }
            outcome.last_key = Some(key);
        }
        Ok(outcome)
    }

    /// Commit one chunk in its own transaction, retrying on conflicts.
    fn run_chunk<F>(
        &self,
        store: &Store,
        progress: &mut BackfillProgress,
        mut chunk: F,
    ) -> Result<ChunkOutcome, MigrationError>
    where
        F: FnMut(&mut Tx<'_>) -> Result<ChunkOutcome, Error>,
    {
        let mut attempts = 0;
        loop {
            match store.update(&mut chunk) {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_conflict() && attempts < self.config.max_conflict_retries => {
                    attempts += 1;
                    progress.conflicts += 1;
                    warn!(
                        index = self.index.name(),
                        attempt = attempts,
                        error = %e,
                        "chunk conflicted with a concurrent write, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Migration for IndexMigration {
    fn name(&self) -> &str {
        &self.name
    }

    /// Backfill the index, then flip its read path in `tx`.
    ///
    /// The chunks commit through their own transactions on the same store;
    /// `tx` only carries the flag flip.
    fn up(&self, ctx: &Context, tx: &mut Tx<'_>) -> Result<(), MigrationError> {
        let store = tx.store();
        let mut progress = BackfillProgress::default();

        let result = store
            .update(|sub| self.index.init(sub))
            .map_err(MigrationError::from)
            .and_then(|_| self.backfill(ctx, store, &mut progress))
            .and_then(|_| {
                if self.config.cleanup {
                    self.cleanup(ctx, store, &mut progress)
                } else {
                    Ok(())
                }
            });
        *self.last_progress.lock() = Some(progress.clone());
        result?;

        ctx.check()?;
        self.index.enable_read_path(tx)?;

        info!(
            index = self.index.name(),
            scanned = progress.scanned,
            indexed = progress.indexed,
            chunks = progress.chunks,
            conflicts = progress.conflicts,
            removed = progress.removed,
            rewritten = progress.rewritten,
            "index backfill complete"
        );
        Ok(())
    }

    fn down(&self, ctx: &Context, tx: &mut Tx<'_>) -> Result<(), MigrationError> {
        ctx.check()?;
        self.index.disable_read_path(tx)?;
        if self.config.clear_on_down {
            self.index.clear(tx)?;
        }
        info!(
            index = self.index.name(),
            cleared = self.config.clear_on_down,
            "index read path disabled"
        );
        Ok(())
    }
}

impl std::fmt::Debug for IndexMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexMigration")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexMapping, IndexedValue};
    use crate::storage::StorageConfig;

    fn upper_index() -> Index {
        Index::new(IndexMapping::new("by_upper", "words", "words_by_upper", |key, value| {
            if value.is_empty() {
                return Ok(None);
            }
            Ok(Some(IndexedValue::new(value.to_ascii_uppercase(), key.to_vec())))
        }))
    }

    fn seeded_store(count: usize) -> Store {
        let store = Store::open(StorageConfig::temporary()).unwrap();
        store
            .update(|tx| -> Result<(), Error> {
                tx.create_bucket("words")?;
                for i in 0..count {
                    tx.put("words", format!("w{:03}", i), format!("word{}", i))?;
                }
                Ok(())
            })
            .unwrap();
        store
    }

    #[test]
    fn test_chunks_cover_every_record() {
        let store = seeded_store(25);
        let migration = IndexMigration::new(
            "index words",
            upper_index(),
            BackfillConfig::default().with_batch_size(10),
        );
        let ctx = Context::background();

        store.update(|tx| migration.up(&ctx, tx)).unwrap();

        let progress = migration.last_progress().unwrap();
        assert_eq!(progress.scanned, 25);
        assert_eq!(progress.indexed, 25);
        // 10 + 10 + 5
        assert_eq!(progress.chunks, 3);

        let index = migration.index();
        store
            .view(|tx| -> Result<(), Error> {
                assert!(index.is_read_path_enabled(tx)?);
                assert_eq!(index.get(tx, b"WORD7")?.as_deref(), Some(&b"w007"[..]));
                assert!(index.verify(tx)?.is_consistent());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_zero_batch_size_still_indexes() {
        let store = seeded_store(3);
        let config = BackfillConfig {
            batch_size: 0,
            ..BackfillConfig::default()
        };
        let migration = IndexMigration::new("index words", upper_index(), config);
        assert_eq!(migration.config().batch_size, 1);

        let ctx = Context::background();
        store.update(|tx| migration.up(&ctx, tx)).unwrap();

        assert_eq!(migration.last_progress().unwrap().indexed, 3);
        let index = migration.index();
        store
            .view(|tx| -> Result<(), Error> {
                assert!(index.is_read_path_enabled(tx)?);
                assert_eq!(index.get(tx, b"WORD0")?.as_deref(), Some(&b"w000"[..]));
                assert!(index.verify(tx)?.is_consistent());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_exact_multiple_of_batch_size() {
        let store = seeded_store(20);
        let migration = IndexMigration::new(
            "index words",
            upper_index(),
            BackfillConfig::default().with_batch_size(10),
        );

        store
            .update(|tx| migration.up(&Context::background(), tx))
            .unwrap();

        // Final empty chunk confirms the end of the bucket
        let progress = migration.last_progress().unwrap();
        assert_eq!(progress.chunks, 3);
        assert_eq!(progress.indexed, 20);
    }

    #[test]
    fn test_missing_source_bucket() {
        let store = Store::open(StorageConfig::temporary()).unwrap();
        let migration = IndexMigration::new("index words", upper_index(), BackfillConfig::default());

        store
            .update(|tx| migration.up(&Context::background(), tx))
            .unwrap();

        let enabled = store
            .view(|tx| migration.index().is_read_path_enabled(tx))
            .unwrap();
        assert!(enabled);
        assert_eq!(migration.last_progress().unwrap().scanned, 0);
    }

    #[test]
    fn test_cancelled_before_flip() {
        let store = seeded_store(30);
        let ctx = Context::background();
        let cancel = ctx.clone();
        let migration = IndexMigration::new(
            "index words",
            upper_index(),
            BackfillConfig::default().with_batch_size(10),
        )
        .with_batch_hook(move |_, progress| {
            if progress.chunks == 1 {
                cancel.cancel();
            }
        });

        let err = store.update(|tx| migration.up(&ctx, tx)).unwrap_err();
        assert!(err.is_cancellation());

        // First chunk stays committed, the flag never flipped
        assert_eq!(migration.last_progress().unwrap().scanned, 10);
        let enabled = store
            .view(|tx| migration.index().is_read_path_enabled(tx))
            .unwrap();
        assert!(!enabled);
    }

    #[test]
    fn test_down_clears_index() {
        let store = seeded_store(5);
        let migration = IndexMigration::new("index words", upper_index(), BackfillConfig::default());
        let ctx = Context::background();

        store.update(|tx| migration.up(&ctx, tx)).unwrap();
        store.update(|tx| migration.down(&ctx, tx)).unwrap();

        store
            .view(|tx| -> Result<(), Error> {
                assert!(!migration.index().is_read_path_enabled(tx)?);
                assert!(tx.scan("words_by_upper", None, 10)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_down_keeps_entries_when_configured() {
        let store = seeded_store(5);
        let migration = IndexMigration::new(
            "index words",
            upper_index(),
            BackfillConfig::default().with_clear_on_down(false),
        );
        let ctx = Context::background();

        store.update(|tx| migration.up(&ctx, tx)).unwrap();
        store.update(|tx| migration.down(&ctx, tx)).unwrap();

        let entries = store
            .view(|tx| tx.scan("words_by_upper", None, 10))
            .unwrap();
        assert_eq!(entries.len(), 5);
    }
}
