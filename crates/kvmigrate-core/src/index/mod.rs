//! Secondary indexes over store buckets.
//!
//! An [`Index`] maps primary records of a source bucket to entries in its own
//! bucket through an [`IndexMapping`]. Writers keep it in sync by calling
//! [`Index::put`] and [`Index::delete`] (or the [`Index::write_primary`] /
//! [`Index::delete_primary`] helpers) in the same transaction as the primary
//! write, whether or not the index is readable yet. Lookups are gated by a
//! persisted read-path flag that only flips once a backfill has populated
//! every entry.
//!
//! Entry layout: key = `[len(secondary) u32 BE][secondary][primary]`,
//! value = payload. The read-path flag is stored under the index name in the
//! shared [`INDEX_STATE_BUCKET`].

mod mapping;

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::Error;
use crate::storage::key::{composite_prefix, decode_composite, encode_composite};
use crate::storage::Tx;

pub use mapping::{IndexMapping, IndexedValue};

/// Bucket holding the read-path flag of every index.
pub const INDEX_STATE_BUCKET: &str = "index:state";

/// Page size used when an index walks a whole bucket.
const SCAN_PAGE_SIZE: usize = 512;

const FLAG_ENABLED: &[u8] = &[1];
const FLAG_DISABLED: &[u8] = &[0];

/// A stored index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Key the entry is looked up by.
    pub secondary_key: Vec<u8>,
    /// Key of the primary record the entry was derived from.
    pub primary_key: Vec<u8>,
    /// Stored payload.
    pub payload: Vec<u8>,
}

impl IndexEntry {
    /// Decode an entry from its raw key and stored payload.
    pub fn from_storage(key: &[u8], payload: Vec<u8>) -> Result<Self, Error> {
        let (secondary, primary) = decode_composite(key).ok_or(Error::InvalidKey)?;
        Ok(Self {
            secondary_key: secondary.to_vec(),
            primary_key: primary.to_vec(),
            payload,
        })
    }

    /// The raw key this entry is stored under.
    pub fn storage_key(&self) -> Vec<u8> {
        encode_composite(&self.secondary_key, &self.primary_key)
    }
}

/// Outcome of re-checking one stored entry against primary data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryCheck {
    /// The primary record still maps to this entry.
    Valid,
    /// The primary record is gone or maps elsewhere.
    Orphaned,
    /// The primary record maps to this key with a different payload.
    Stale {
        /// Payload the mapping produces now.
        payload: Vec<u8>,
    },
}

/// Differences between an index and its source bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDiff {
    /// Entries the mapping produces that the index lacks.
    pub missing: Vec<IndexEntry>,
    /// Stored entries no primary record maps to.
    pub orphaned: Vec<IndexEntry>,
    /// Stored entries whose payload differs from the mapping's.
    pub stale: Vec<IndexEntry>,
}

impl IndexDiff {
    /// Whether the index exactly mirrors its source bucket.
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.orphaned.is_empty() && self.stale.is_empty()
    }
}

/// A secondary index with a gated read path.
#[derive(Debug, Clone)]
pub struct Index {
    mapping: IndexMapping,
}

impl Index {
    /// Create an index over the given mapping.
    pub fn new(mapping: IndexMapping) -> Self {
        Self { mapping }
    }

    /// Index name.
    pub fn name(&self) -> &str {
        self.mapping.name()
    }

    /// The mapping this index maintains.
    pub fn mapping(&self) -> &IndexMapping {
        &self.mapping
    }

    /// Create the index and state buckets if missing.
    pub fn init(&self, tx: &mut Tx<'_>) -> Result<(), Error> {
        tx.create_bucket(self.mapping.index_bucket())?;
        tx.create_bucket(INDEX_STATE_BUCKET)?;
        Ok(())
    }

    // ========== Read path ==========

    /// Whether lookups may consult the index.
    pub fn is_read_path_enabled(&self, tx: &mut Tx<'_>) -> Result<bool, Error> {
        if !tx.bucket_exists(INDEX_STATE_BUCKET)? {
            return Ok(false);
        }
        let flag = tx.get(INDEX_STATE_BUCKET, self.name())?;
        Ok(flag.as_deref() == Some(FLAG_ENABLED))
    }

    /// Flip the read path on.
    pub fn enable_read_path(&self, tx: &mut Tx<'_>) -> Result<(), Error> {
        self.init(tx)?;
        tx.put(INDEX_STATE_BUCKET, self.name(), FLAG_ENABLED)?;
        debug!(index = self.name(), "index read path enabled");
        Ok(())
    }

    /// Flip the read path off. Only migrations reverting the index use this.
    pub fn disable_read_path(&self, tx: &mut Tx<'_>) -> Result<(), Error> {
        if tx.bucket_exists(INDEX_STATE_BUCKET)? {
            tx.put(INDEX_STATE_BUCKET, self.name(), FLAG_DISABLED)?;
            debug!(index = self.name(), "index read path disabled");
        }
        Ok(())
    }

    /// Look up the payload for a secondary key.
    ///
    /// Fails with [`Error::IndexNotReady`] until the read path is enabled, so
    /// callers never see a partially backfilled index. When several primary
    /// records share the key, the entry with the lowest primary key wins.
    pub fn get(&self, tx: &mut Tx<'_>, secondary_key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .get_all(tx, secondary_key)?
            .into_iter()
            .next()
            .map(|entry| entry.payload))
    }

    /// Every entry stored under a secondary key, ordered by primary key.
    pub fn get_all(&self, tx: &mut Tx<'_>, secondary_key: &[u8]) -> Result<Vec<IndexEntry>, Error> {
        self.ensure_ready(tx)?;
        tx.scan_prefix(self.mapping.index_bucket(), &composite_prefix(secondary_key))?
            .into_iter()
            .map(|(key, payload)| IndexEntry::from_storage(&key, payload))
            .collect()
    }

    /// Like [`Index::get_all`], but scans the source bucket while the read
    /// path is still disabled.
    pub fn find_or_scan(
        &self,
        tx: &mut Tx<'_>,
        secondary_key: &[u8],
    ) -> Result<Vec<IndexEntry>, Error> {
        if self.is_read_path_enabled(tx)? {
            return self.get_all(tx, secondary_key);
        }

        let mut found = Vec::new();
        self.for_each_primary(tx, |primary_key, value| {
            if value.secondary_key == secondary_key {
                found.push(IndexEntry {
                    secondary_key: value.secondary_key,
                    primary_key: primary_key.to_vec(),
                    payload: value.payload,
                });
            }
        })?;
        Ok(found)
    }

    fn ensure_ready(&self, tx: &mut Tx<'_>) -> Result<(), Error> {
        if self.is_read_path_enabled(tx)? {
            Ok(())
        } else {
            Err(Error::IndexNotReady {
                index: self.name().to_string(),
            })
        }
    }

    // ========== Write path ==========

    /// Index a primary record. Returns whether the mapping produced an entry.
    ///
    /// Must be called for every write to the source bucket, independent of
    /// the read-path state. The index bucket is created on first use, so
    /// writers work before the backfill migration has run.
    pub fn put(&self, tx: &mut Tx<'_>, primary_key: &[u8], value: &[u8]) -> Result<bool, Error> {
        match self.mapping.map(primary_key, value)? {
            Some(indexed) => {
                self.init(tx)?;
                tx.put(
                    self.mapping.index_bucket(),
                    encode_composite(&indexed.secondary_key, primary_key),
                    &indexed.payload,
                )?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the entry derived from a primary record that is being deleted.
    ///
    /// A missing index bucket holds no entries, so there is nothing to remove.
    pub fn delete(&self, tx: &mut Tx<'_>, primary_key: &[u8], value: &[u8]) -> Result<(), Error> {
        if let Some(indexed) = self.mapping.map(primary_key, value)? {
            self.remove_entry(tx, &indexed.secondary_key, primary_key)?;
        }
        Ok(())
    }

    fn remove_entry(
        &self,
        tx: &mut Tx<'_>,
        secondary_key: &[u8],
        primary_key: &[u8],
    ) -> Result<(), Error> {
        let bucket = self.mapping.index_bucket();
        if tx.bucket_exists(bucket)? {
            tx.delete(bucket, encode_composite(secondary_key, primary_key))?;
        }
        Ok(())
    }

    /// Write a primary record and its index entry in one transaction.
    ///
    /// If the record previously mapped to a different secondary key, the old
    /// entry is removed.
    pub fn write_primary(
        &self,
        tx: &mut Tx<'_>,
        primary_key: &[u8],
        value: &[u8],
    ) -> Result<(), Error> {
        let source = self.mapping.source_bucket();
        if let Some(previous) = tx.get(source, primary_key)? {
            let before = self.mapping.map(primary_key, &previous)?;
            let after = self.mapping.map(primary_key, value)?;
            if let Some(before) = before {
                let moved = after
                    .as_ref()
                    .map_or(true, |after| after.secondary_key != before.secondary_key);
                if moved {
                    self.remove_entry(tx, &before.secondary_key, primary_key)?;
                }
            }
        }

        tx.put(source, primary_key, value)?;
        self.put(tx, primary_key, value)?;
        Ok(())
    }

    /// Delete a primary record and its index entry in one transaction.
    ///
    /// Returns whether the record existed.
    pub fn delete_primary(&self, tx: &mut Tx<'_>, primary_key: &[u8]) -> Result<bool, Error> {
        let source = self.mapping.source_bucket();
        match tx.get(source, primary_key)? {
            Some(previous) => {
                self.delete(tx, primary_key, &previous)?;
                tx.delete(source, primary_key)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every entry, keeping the index bucket.
    pub fn clear(&self, tx: &mut Tx<'_>) -> Result<(), Error> {
        if tx.bucket_exists(self.mapping.index_bucket())? {
            tx.clear_bucket(self.mapping.index_bucket())?;
        }
        Ok(())
    }

    // ========== Consistency ==========

    /// Re-check a stored entry against the primary record it points at.
    pub fn check_entry(&self, tx: &mut Tx<'_>, entry: &IndexEntry) -> Result<EntryCheck, Error> {
        let Some(value) = tx.get(self.mapping.source_bucket(), &entry.primary_key)? else {
            return Ok(EntryCheck::Orphaned);
        };
        match self.mapping.map(&entry.primary_key, &value)? {
            Some(indexed) if indexed.secondary_key == entry.secondary_key => {
                if indexed.payload == entry.payload {
                    Ok(EntryCheck::Valid)
                } else {
                    Ok(EntryCheck::Stale {
                        payload: indexed.payload,
                    })
                }
            }
            _ => Ok(EntryCheck::Orphaned),
        }
    }

    /// Compare the whole index against its source bucket.
    ///
    /// Reads both buckets in full within `tx`; intended for diagnostics.
    pub fn verify(&self, tx: &mut Tx<'_>) -> Result<IndexDiff, Error> {
        let mut expected: BTreeMap<Vec<u8>, IndexEntry> = BTreeMap::new();
        self.for_each_primary(tx, |primary_key, value| {
            let entry = IndexEntry {
                secondary_key: value.secondary_key,
                primary_key: primary_key.to_vec(),
                payload: value.payload,
            };
            expected.insert(entry.storage_key(), entry);
        })?;

        let mut diff = IndexDiff::default();
        if tx.bucket_exists(self.mapping.index_bucket())? {
            let mut after: Option<Vec<u8>> = None;
            loop {
                let page = tx.scan(self.mapping.index_bucket(), after.as_deref(), SCAN_PAGE_SIZE)?;
                let Some((last, _)) = page.last() else {
                    break;
                };
                after = Some(last.clone());

                for (key, payload) in page {
                    let stored = IndexEntry::from_storage(&key, payload)?;
                    match expected.remove(&key) {
                        Some(wanted) if wanted.payload == stored.payload => {}
                        Some(_) => diff.stale.push(stored),
                        None => diff.orphaned.push(stored),
                    }
                }
            }
        }
        diff.missing = expected.into_values().collect();
        Ok(diff)
    }

    /// Walk the source bucket, calling `f` for every record the mapping tracks.
    fn for_each_primary<F>(&self, tx: &mut Tx<'_>, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&[u8], IndexedValue),
    {
        let source = self.mapping.source_bucket();
        if !tx.bucket_exists(source)? {
            return Ok(());
        }

        let mut after: Option<Vec<u8>> = None;
        loop {
            let page = tx.scan(source, after.as_deref(), SCAN_PAGE_SIZE)?;
            let Some((last, _)) = page.last() else {
                break;
            };
            after = Some(last.clone());

            for (primary_key, value) in &page {
                if let Some(indexed) = self.mapping.map(primary_key, value)? {
                    f(primary_key.as_slice(), indexed);
                }
            }
        }
        Ok(())
    }
}
