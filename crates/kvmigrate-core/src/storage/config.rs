//! Store location and sled tuning.

use std::path::PathBuf;

/// Configuration for the bucket store.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding the metadata store.
    pub path: PathBuf,

    /// sled cache size in bytes.
    pub cache_capacity: u64,

    /// Background flush period in milliseconds. None disables background flushing.
    pub flush_every_ms: Option<u64>,

    /// Flush to disk after every successful commit.
    pub sync_writes: bool,

    /// Compress pages on disk.
    pub compression: bool,

    /// In-memory store removed when the last handle drops. Used by tests.
    pub temporary: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./kvmigrate_data"),
            cache_capacity: 256 * 1024 * 1024, // 256MB
            flush_every_ms: Some(500),
            sync_writes: false,
            compression: true,
            temporary: false,
        }
    }
}

impl StorageConfig {
    /// Store rooted at `path` with default tuning.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self { path, ..Self::default() }
    }

    /// Throwaway store for tests.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::new(),
            temporary: true,
            ..Self::default()
        }
    }

    /// Set the cache size.
    pub fn with_cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Flush to disk after every successful commit, on top of background flushing.
    pub fn with_sync_writes(mut self) -> Self {
        self.sync_writes = true;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub(crate) fn to_sled_config(&self) -> sled::Config {
        let config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .use_compression(self.compression)
            .flush_every_ms(self.flush_every_ms);

        match self.temporary {
            true => config.temporary(true),
            false => config.path(&self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.path, PathBuf::from("./kvmigrate_data"));
        assert_eq!(config.flush_every_ms, Some(500));
        assert!(!config.temporary);
    }

    #[test]
    fn test_builder() {
        let config = StorageConfig::new("/var/lib/kvmigrate")
            .with_cache_capacity(1024)
            .with_sync_writes()
            .with_compression(false);

        assert_eq!(config.path, PathBuf::from("/var/lib/kvmigrate"));
        assert_eq!(config.cache_capacity, 1024);
        assert!(config.sync_writes);
        assert_eq!(config.flush_every_ms, Some(500));
        assert!(!config.compression);
    }

    #[test]
    fn test_temporary_opens() {
        let db = StorageConfig::temporary().to_sled_config().open().unwrap();
        db.insert(b"k", b"v".to_vec()).unwrap();
        assert_eq!(db.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
    }
}
