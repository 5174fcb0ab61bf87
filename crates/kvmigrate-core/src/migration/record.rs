//! Persisted migration records.
//!
//! One record per applied migration, keyed by its position in the registry.
//! Records always form a contiguous prefix `0..applied_count`.

use rkyv::{Archive, Deserialize, Serialize};

use super::error::MigrationError;
use crate::storage::key::{current_timestamp, decode_sequence, encode_sequence};
use crate::storage::Tx;

/// Record of one applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Position of the migration in the registry.
    pub sequence_index: u64,
    /// Name the migration had when it was applied.
    pub name: String,
    /// When the migration was applied (microseconds since epoch).
    pub applied_at: u64,
}

impl MigrationRecord {
    /// Create a record stamped with the current time.
    pub fn new(sequence_index: u64, name: impl Into<String>) -> Self {
        Self {
            sequence_index,
            name: name.into(),
            applied_at: current_timestamp(),
        }
    }

    /// Serialize the record to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize a record from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Access to the `migrations` bucket through a transaction.
pub struct MigrationRecordStore;

impl MigrationRecordStore {
    /// Bucket holding migration records.
    pub const BUCKET: &'static str = "migrations";

    /// Load every record in sequence order.
    ///
    /// A missing bucket means nothing was applied yet. Gaps or keys that
    /// disagree with their record are reported as corruption.
    pub fn list(tx: &mut Tx<'_>) -> Result<Vec<MigrationRecord>, MigrationError> {
        if !tx.bucket_exists(Self::BUCKET)? {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for (key, value) in tx.scan(Self::BUCKET, None, usize::MAX)? {
            let expected = records.len() as u64;
            let sequence = decode_sequence(&key).ok_or_else(|| MigrationError::StateCorrupted {
                message: format!("invalid record key {}", hex::encode(&key)),
            })?;
            if sequence != expected {
                return Err(MigrationError::StateCorrupted {
                    message: format!("expected record {} but found {}", expected, sequence),
                });
            }

            let record = MigrationRecord::from_bytes(&value)?;
            if record.sequence_index != sequence {
                return Err(MigrationError::StateCorrupted {
                    message: format!(
                        "record stored under {} claims index {}",
                        sequence, record.sequence_index
                    ),
                });
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Number of applied migrations.
    pub fn applied_count(tx: &mut Tx<'_>) -> Result<usize, MigrationError> {
        Ok(Self::list(tx)?.len())
    }

    /// Persist a record, creating the bucket on first use.
    ///
    /// Fails if a record already exists at the same position.
    pub fn insert(tx: &mut Tx<'_>, record: &MigrationRecord) -> Result<(), MigrationError> {
        let key = encode_sequence(record.sequence_index);
        tx.create_bucket(Self::BUCKET)?;
        if tx.contains(Self::BUCKET, key)? {
            return Err(MigrationError::StateCorrupted {
                message: format!("migration {} is already recorded", record.sequence_index),
            });
        }
        tx.put(Self::BUCKET, key, record.to_bytes()?)?;
        Ok(())
    }

    /// Remove the record at `sequence_index`.
    pub fn remove(tx: &mut Tx<'_>, sequence_index: u64) -> Result<(), MigrationError> {
        tx.delete(Self::BUCKET, encode_sequence(sequence_index))?;
        Ok(())
    }
}
