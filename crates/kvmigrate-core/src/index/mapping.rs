//! Mapping functions from primary records to index entries.

use std::fmt;
use std::sync::Arc;

use crate::error::Error;

/// The index-side projection of one primary record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedValue {
    /// Key the record is looked up by.
    pub secondary_key: Vec<u8>,
    /// Value returned by lookups.
    pub payload: Vec<u8>,
}

impl IndexedValue {
    /// Create a new indexed value.
    pub fn new(secondary_key: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            secondary_key: secondary_key.into(),
            payload: payload.into(),
        }
    }
}

type MapFn = dyn Fn(&[u8], &[u8]) -> Result<Option<IndexedValue>, Error> + Send + Sync;

/// Derives index entries from records of a source bucket.
///
/// The function receives `(primary_key, primary_value)` and returns `None`
/// for records the index does not track. It must be deterministic: backfill,
/// dual-write and cleanup all recompute it and compare the results.
#[derive(Clone)]
pub struct IndexMapping {
    name: String,
    source_bucket: String,
    index_bucket: String,
    map: Arc<MapFn>,
}

impl IndexMapping {
    /// Create a mapping from `source_bucket` into `index_bucket`.
    pub fn new<F>(
        name: impl Into<String>,
        source_bucket: impl Into<String>,
        index_bucket: impl Into<String>,
        map: F,
    ) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Result<Option<IndexedValue>, Error> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            source_bucket: source_bucket.into(),
            index_bucket: index_bucket.into(),
            map: Arc::new(map),
        }
    }

    /// Index name, also the key of its read-path flag.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bucket holding the primary records.
    pub fn source_bucket(&self) -> &str {
        &self.source_bucket
    }

    /// Bucket holding the index entries.
    pub fn index_bucket(&self) -> &str {
        &self.index_bucket
    }

    /// Apply the mapping to one primary record.
    pub fn map(&self, primary_key: &[u8], value: &[u8]) -> Result<Option<IndexedValue>, Error> {
        (self.map)(primary_key, value)
    }
}

impl fmt::Debug for IndexMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexMapping")
            .field("name", &self.name)
            .field("source_bucket", &self.source_bucket)
            .field("index_bucket", &self.index_bucket)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_applies_function() {
        let mapping = IndexMapping::new("by_owner", "docs", "docs_by_owner", |pk, value| {
            if value.is_empty() {
                return Ok(None);
            }
            Ok(Some(IndexedValue::new(value.to_vec(), pk.to_vec())))
        });

        assert_eq!(
            mapping.map(b"d1", b"alice").unwrap(),
            Some(IndexedValue::new(b"alice".to_vec(), b"d1".to_vec()))
        );
        assert!(mapping.map(b"d2", b"").unwrap().is_none());
    }

    #[test]
    fn test_debug_omits_function() {
        let mapping = IndexMapping::new("by_owner", "docs", "docs_by_owner", |_, _| Ok(None));
        let debug = format!("{:?}", mapping);
        assert!(debug.contains("docs_by_owner"));
        assert!(debug.contains(".."));
    }
}
