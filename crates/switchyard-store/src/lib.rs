//! Switchyard Store
//!
//! This crate provides the storage traits the engine consumes, plus
//! in-memory and file-backed implementations.
//!
//! - [`KvStore`] backs storage nodes and node result caching. A missing key
//!   is reported as [`StoreError::NotFound`], never as an I/O failure.
//! - [`CheckpointStore`] persists one opaque snapshot per execution.

mod file;
mod memory;
mod types;

pub use file::{FileCheckpointStore, FileKvStore};
pub use memory::{MemoryCheckpointStore, MemoryKvStore};
pub use types::{PutOptions, StoredValue};

use async_trait::async_trait;

/// Error type for key-value operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested key does not exist (or has expired).
  #[error("not found: {0}")]
  NotFound(String),

  /// The backend failed to read or write.
  #[error("storage I/O error: {0}")]
  Io(String),

  /// A stored record could not be encoded or decoded.
  #[error("serialization error: {0}")]
  Serialization(String),
}

/// Error type for checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
  #[error("checkpoint not found: {0}")]
  NotFound(String),

  #[error("checkpoint corrupted: {0}")]
  Corrupted(String),

  #[error("checkpoint for execution '{execution_id}' is incompatible: {message}")]
  Incompatible {
    execution_id: String,
    message: String,
  },

  #[error("checkpoint storage error: {0}")]
  Storage(String),

  #[error("checkpoint serialization error: {0}")]
  Serialization(String),
}

/// Key-value storage used by storage nodes.
#[async_trait]
pub trait KvStore: Send + Sync {
  /// Read a record.
  async fn get(&self, key: &str) -> Result<StoredValue, StoreError>;

  /// Write a record, replacing any previous value.
  async fn put(
    &self,
    key: &str,
    value: serde_json::Value,
    opts: PutOptions,
  ) -> Result<StoredValue, StoreError>;

  /// Delete a record. Deleting a missing key returns `NotFound`.
  async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Persistence for execution snapshots, keyed by execution id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
  /// Save a snapshot, replacing the previous one for this execution.
  async fn save(
    &self,
    execution_id: &str,
    snapshot: &serde_json::Value,
  ) -> Result<(), CheckpointError>;

  /// Load the latest snapshot, or `None` if none was saved.
  async fn load(&self, execution_id: &str) -> Result<Option<serde_json::Value>, CheckpointError>;

  async fn delete(&self, execution_id: &str) -> Result<(), CheckpointError>;
}
