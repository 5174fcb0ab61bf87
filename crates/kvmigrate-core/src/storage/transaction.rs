//! Transactions over named buckets.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{IVec, Transactional, Tree};

use super::engine::{bucket_tree_name, display_tree_name, BUCKET_REGISTRY_TREE};
use super::Store;
use crate::error::Error;

/// Pending writes for one tree (`None` marks a delete).
type PendingWrites = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// A transaction over the store's buckets.
///
/// Writes are buffered and applied atomically on commit; reads see this
/// transaction's own pending writes first. Every committed value the
/// transaction observes is re-validated inside the commit, so a transaction
/// whose reads went stale aborts with [`Error::TransactionConflict`] instead of
/// overwriting a concurrent change.
pub struct Tx<'a> {
    store: &'a Store,
    writable: bool,
    /// Tree name -> pending writes.
    writes: BTreeMap<String, PendingWrites>,
    /// Trees whose committed contents are discarded on commit.
    truncated: BTreeSet<String>,
    /// Committed values observed by this transaction, keyed by (tree, key).
    observed: HashMap<(String, Vec<u8>), Option<Vec<u8>>>,
    trees: HashMap<String, Tree>,
}

impl<'a> Tx<'a> {
    pub(crate) fn new(store: &'a Store, writable: bool) -> Self {
        Self {
            store,
            writable,
            writes: BTreeMap::new(),
            truncated: BTreeSet::new(),
            observed: HashMap::new(),
            trees: HashMap::new(),
        }
    }

    /// The store this transaction belongs to.
    ///
    /// Transactions opened from the returned handle commit independently of
    /// this one.
    pub fn store(&self) -> &'a Store {
        self.store
    }

    /// Whether this transaction accepts writes.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Number of buffered key writes and deletes.
    pub fn pending_writes(&self) -> usize {
        self.writes.values().map(BTreeMap::len).sum()
    }

    // ========== Buckets ==========

    /// Check whether a bucket has been created.
    pub fn bucket_exists(&mut self, bucket: &str) -> Result<bool, Error> {
        Ok(self
            .read_tree(BUCKET_REGISTRY_TREE, bucket.as_bytes())?
            .is_some())
    }

    /// Create a bucket if it does not exist yet.
    ///
    /// Returns `true` if the bucket was created by this call.
    pub fn create_bucket(&mut self, bucket: &str) -> Result<bool, Error> {
        self.ensure_writable()?;
        if self.bucket_exists(bucket)? {
            return Ok(false);
        }
        self.write_tree(BUCKET_REGISTRY_TREE, bucket.as_bytes(), Some(Vec::new()));
        Ok(true)
    }

    /// Delete a bucket and every entry in it.
    ///
    /// The entries removed are those present when [`Tx::commit`] starts. A
    /// concurrent transaction committing to the bucket during that commit
    /// can leave entries behind.
    pub fn delete_bucket(&mut self, bucket: &str) -> Result<(), Error> {
        self.ensure_writable()?;
        let tree_name = self.require_bucket(bucket)?;
        self.write_tree(BUCKET_REGISTRY_TREE, bucket.as_bytes(), None);
        self.writes.remove(&tree_name);
        self.truncated.insert(tree_name);
        Ok(())
    }

    /// Delete every entry in a bucket, keeping the bucket itself.
    ///
    /// Same snapshot rule as [`Tx::delete_bucket`].
    pub fn clear_bucket(&mut self, bucket: &str) -> Result<(), Error> {
        self.ensure_writable()?;
        let tree_name = self.require_bucket(bucket)?;
        self.writes.remove(&tree_name);
        self.truncated.insert(tree_name);
        Ok(())
    }

    // ========== Entries ==========

    /// Read a value.
    pub fn get(&mut self, bucket: &str, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, Error> {
        let tree_name = self.require_bucket(bucket)?;
        self.read_tree(&tree_name, key.as_ref())
    }

    /// Check whether a key exists.
    pub fn contains(&mut self, bucket: &str, key: impl AsRef<[u8]>) -> Result<bool, Error> {
        Ok(self.get(bucket, key)?.is_some())
    }

    /// Write a value, replacing any previous one.
    pub fn put(
        &mut self,
        bucket: &str,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<(), Error> {
        self.ensure_writable()?;
        let tree_name = self.require_bucket(bucket)?;
        self.write_tree(&tree_name, key.as_ref(), Some(value.as_ref().to_vec()));
        Ok(())
    }

    /// Delete a key. Deleting a missing key is not an error.
    pub fn delete(&mut self, bucket: &str, key: impl AsRef<[u8]>) -> Result<(), Error> {
        self.ensure_writable()?;
        let tree_name = self.require_bucket(bucket)?;
        self.write_tree(&tree_name, key.as_ref(), None);
        Ok(())
    }

    /// Scan up to `limit` entries in key order, starting strictly after `after`.
    ///
    /// Pass the last key of one page as `after` to fetch the next page.
    pub fn scan(
        &mut self,
        bucket: &str,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let tree_name = self.require_bucket(bucket)?;
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_vec()),
            None => Bound::Unbounded,
        };
        self.scan_tree(&tree_name, lower, None, limit)
    }

    /// Scan every entry whose key starts with `prefix`.
    pub fn scan_prefix(
        &mut self,
        bucket: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let tree_name = self.require_bucket(bucket)?;
        self.scan_tree(
            &tree_name,
            Bound::Included(prefix.to_vec()),
            Some(prefix),
            usize::MAX,
        )
    }

    // ========== Completion ==========

    /// Commit the transaction atomically.
    ///
    /// All buffered operations succeed or none do. Read-only transactions
    /// and transactions without writes commit trivially.
    pub fn commit(self) -> Result<(), Error> {
        if !self.writable {
            return Ok(());
        }
        let write_count = self.pending_writes();
        if write_count == 0 && self.truncated.is_empty() {
            return Ok(());
        }

        let mut names: BTreeSet<&str> = BTreeSet::new();
        names.extend(self.writes.keys().map(String::as_str));
        names.extend(self.truncated.iter().map(String::as_str));
        names.extend(self.observed.keys().map(|(tree_name, _)| tree_name.as_str()));
        let names: Vec<&str> = names.into_iter().collect();

        let trees = names
            .iter()
            .map(|name| self.store.tree(name))
            .collect::<Result<Vec<_>, _>>()?;
        let position: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (*name, idx))
            .collect();

        // sled transactions cannot iterate, so truncated trees are listed up
        // front. Keys committed by others after this point are not purged.
        let mut purge: Vec<(usize, Vec<IVec>)> = Vec::new();
        for tree_name in &self.truncated {
            let idx = position[tree_name.as_str()];
            let keys = trees[idx].iter().keys().collect::<Result<Vec<_>, _>>()?;
            purge.push((idx, keys));
        }
        let purged: usize = purge.iter().map(|(_, keys)| keys.len()).sum();

        let result: Result<(), TransactionError<Error>> =
            trees.as_slice().transaction(|views| {
                for ((tree_name, key), expected) in &self.observed {
                    let view = &views[position[tree_name.as_str()]];
                    let current = view.get(key.as_slice())?;
                    if current.as_deref() != expected.as_deref() {
                        return Err(ConflictableTransactionError::Abort(
                            Error::TransactionConflict {
                                bucket: display_tree_name(tree_name).to_string(),
                                key: hex::encode(key),
                            },
                        ));
                    }
                }

                for (idx, keys) in &purge {
                    let view = &views[*idx];
                    for key in keys {
                        view.remove(key.clone())?;
                    }
                }

                for (tree_name, ops) in &self.writes {
                    let view = &views[position[tree_name.as_str()]];
                    for (key, value) in ops {
                        match value {
                            Some(value) => {
                                view.insert(key.as_slice(), value.as_slice())?;
                            }
                            None => {
                                view.remove(key.as_slice())?;
                            }
                        }
                    }
                }
                Ok(())
            });

        match result {
            Ok(()) => {
                self.store
                    .stats_handle()
                    .record_commit((write_count + purged) as u64);
                if self.store.syncs_writes() {
                    self.store.flush()?;
                    self.store.stats_handle().record_flush();
                }
                Ok(())
            }
            Err(TransactionError::Abort(e)) => {
                if e.is_conflict() {
                    self.store.stats_handle().record_conflict();
                }
                Err(e)
            }
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    /// Rollback the transaction (discard all pending operations).
    pub fn rollback(self) {
        drop(self);
    }

    // ========== Internals ==========

    fn ensure_writable(&self) -> Result<(), Error> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    /// Resolve a bucket to its tree name, failing if it was never created.
    fn require_bucket(&mut self, bucket: &str) -> Result<String, Error> {
        if self.bucket_exists(bucket)? {
            Ok(bucket_tree_name(bucket))
        } else {
            Err(Error::BucketNotFound(bucket.to_string()))
        }
    }

    fn tree(&mut self, tree_name: &str) -> Result<Tree, Error> {
        if let Some(tree) = self.trees.get(tree_name) {
            return Ok(tree.clone());
        }
        let tree = self.store.tree(tree_name)?;
        self.trees.insert(tree_name.to_string(), tree.clone());
        Ok(tree)
    }

    fn read_tree(&mut self, tree_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if let Some(pending) = self.writes.get(tree_name).and_then(|ops| ops.get(key)) {
            return Ok(pending.clone());
        }
        if self.truncated.contains(tree_name) {
            return Ok(None);
        }

        let observed_key = (tree_name.to_string(), key.to_vec());
        if let Some(value) = self.observed.get(&observed_key) {
            return Ok(value.clone());
        }

        let value = self.tree(tree_name)?.get(key)?.map(|v| v.to_vec());
        self.observed.insert(observed_key, value.clone());
        Ok(value)
    }

    fn write_tree(&mut self, tree_name: &str, key: &[u8], value: Option<Vec<u8>>) {
        self.writes
            .entry(tree_name.to_string())
            .or_default()
            .insert(key.to_vec(), value);
    }

    /// Merge committed entries with pending writes in key order.
    fn scan_tree(
        &mut self,
        tree_name: &str,
        lower: Bound<Vec<u8>>,
        prefix: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        let mut base = if self.truncated.contains(tree_name) {
            None
        } else {
            let tree = self.tree(tree_name)?;
            Some(tree.range((lower.clone(), Bound::Unbounded)))
        };

        let pending: Vec<(Vec<u8>, Option<Vec<u8>>)> = self
            .writes
            .get(tree_name)
            .map(|ops| {
                ops.range((lower, Bound::Unbounded))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let mut pending = pending.into_iter().peekable();

        let mut base_head = next_base(&mut base)?;
        let mut out = Vec::new();
        let mut seen = Vec::new();

        while out.len() < limit {
            let from_pending = match (&base_head, pending.peek()) {
                (None, None) => break,
                (Some(_), None) => false,
                (None, Some(_)) => true,
                (Some((base_key, _)), Some((pending_key, _))) => pending_key <= base_key,
            };

            if from_pending {
                let Some((key, value)) = pending.next() else {
                    break;
                };
                if prefix.is_some_and(|p| !key.starts_with(p)) {
                    break;
                }
                // A pending write shadows the committed entry with the same key
                if base_head.as_ref().is_some_and(|(base_key, _)| *base_key == key) {
                    base_head = next_base(&mut base)?;
                }
                if let Some(value) = value {
                    out.push((key, value));
                }
            } else {
                let Some((key, value)) = base_head.take() else {
                    break;
                };
                if prefix.is_some_and(|p| !key.starts_with(p)) {
                    break;
                }
                seen.push((key.clone(), value.clone()));
                out.push((key, value));
                base_head = next_base(&mut base)?;
            }
        }

        for (key, value) in seen {
            self.observed
                .entry((tree_name.to_string(), key))
                .or_insert(Some(value));
        }

        Ok(out)
    }
}

fn next_base(iter: &mut Option<sled::Iter>) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
    match iter.as_mut().and_then(Iterator::next) {
        Some(Ok((key, value))) => Ok(Some((key.to_vec(), value.to_vec()))),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}
