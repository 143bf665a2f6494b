use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{PutOptions, StoredValue};
use crate::{CheckpointError, CheckpointStore, KvStore, StoreError};

/// In-process key-value store. Expired records are dropped on read.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
  data: RwLock<HashMap<String, StoredValue>>,
}

impl MemoryKvStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl KvStore for MemoryKvStore {
  async fn get(&self, key: &str) -> Result<StoredValue, StoreError> {
    let record = self.data.read().await.get(key).cloned();
    match record {
      Some(record) if record.is_expired() => {
        self.data.write().await.remove(key);
        Err(StoreError::NotFound(key.to_string()))
      }
      Some(record) => Ok(record),
      None => Err(StoreError::NotFound(key.to_string())),
    }
  }

  async fn put(
    &self,
    key: &str,
    value: serde_json::Value,
    opts: PutOptions,
  ) -> Result<StoredValue, StoreError> {
    let record = StoredValue::new(value, &opts);
    self
      .data
      .write()
      .await
      .insert(key.to_string(), record.clone());
    Ok(record)
  }

  async fn delete(&self, key: &str) -> Result<(), StoreError> {
    match self.data.write().await.remove(key) {
      Some(_) => Ok(()),
      None => Err(StoreError::NotFound(key.to_string())),
    }
  }
}

/// In-process checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
  data: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryCheckpointStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
  async fn save(
    &self,
    execution_id: &str,
    snapshot: &serde_json::Value,
  ) -> Result<(), CheckpointError> {
    self
      .data
      .write()
      .await
      .insert(execution_id.to_string(), snapshot.clone());
    Ok(())
  }

  async fn load(&self, execution_id: &str) -> Result<Option<serde_json::Value>, CheckpointError> {
    Ok(self.data.read().await.get(execution_id).cloned())
  }

  async fn delete(&self, execution_id: &str) -> Result<(), CheckpointError> {
    self.data.write().await.remove(execution_id);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_missing_key_is_not_found() {
    let store = MemoryKvStore::new();
    let err = store.get("nope").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(key) if key == "nope"));

    let err = store.delete("nope").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
  }

  #[tokio::test]
  async fn test_put_then_get_keeps_version() {
    let store = MemoryKvStore::new();
    store
      .put(
        "k",
        json!({"a": 1}),
        PutOptions {
          version: Some(4),
          ..Default::default()
        },
      )
      .await
      .unwrap();

    let record = store.get("k").await.unwrap();
    assert_eq!(record.value, json!({"a": 1}));
    assert_eq!(record.version, 4);
  }

  #[tokio::test]
  async fn test_expired_record_is_not_found() {
    let store = MemoryKvStore::new();
    store
      .put(
        "k",
        json!(1),
        PutOptions {
          ttl_seconds: Some(0),
          ..Default::default()
        },
      )
      .await
      .unwrap();

    assert!(matches!(
      store.get("k").await.unwrap_err(),
      StoreError::NotFound(_)
    ));
  }

  #[tokio::test]
  async fn test_checkpoint_save_load_delete() {
    let store = MemoryCheckpointStore::new();
    store.save("exec-1", &json!({"seq": 1})).await.unwrap();
    store.save("exec-1", &json!({"seq": 2})).await.unwrap();

    let loaded = store.load("exec-1").await.unwrap().unwrap();
    assert_eq!(loaded["seq"], 2);

    store.delete("exec-1").await.unwrap();
    assert!(store.load("exec-1").await.unwrap().is_none());
  }
}
