//! Storage layer for kvmigrate.
//!
//! This module provides a sled-based store of named buckets with buffered,
//! atomically committed transactions.

mod config;
mod engine;
mod transaction;

pub mod key;

pub use config::StorageConfig;
pub use engine::{Store, StoreStats, StoreStatsSnapshot};
pub use transaction::Tx;
