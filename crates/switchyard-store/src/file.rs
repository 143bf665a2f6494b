use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::types::{PutOptions, StoredValue};
use crate::{CheckpointError, CheckpointStore, KvStore, StoreError};

/// Encode an arbitrary key as a portable file stem.
fn file_stem(key: &str) -> String {
  let mut stem = String::with_capacity(key.len());
  for byte in key.bytes() {
    if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
      stem.push(byte as char);
    } else {
      stem.push_str(&format!("_{byte:02x}"));
    }
  }
  stem
}

/// Key-value store keeping one JSON file per key.
#[derive(Debug, Clone)]
pub struct FileKvStore {
  dir: PathBuf,
}

impl FileKvStore {
  pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
    let dir = dir.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
    Ok(Self { dir })
  }

  fn path_for(&self, key: &str) -> PathBuf {
    self.dir.join(format!("{}.json", file_stem(key)))
  }
}

#[async_trait]
impl KvStore for FileKvStore {
  async fn get(&self, key: &str) -> Result<StoredValue, StoreError> {
    let path = self.path_for(key);
    let bytes = match tokio::fs::read(&path).await {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == ErrorKind::NotFound => {
        return Err(StoreError::NotFound(key.to_string()));
      }
      Err(e) => return Err(StoreError::Io(e.to_string())),
    };

    let record: StoredValue =
      serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;
    if record.is_expired() {
      let _ = tokio::fs::remove_file(&path).await;
      return Err(StoreError::NotFound(key.to_string()));
    }
    Ok(record)
  }

  async fn put(
    &self,
    key: &str,
    value: serde_json::Value,
    opts: PutOptions,
  ) -> Result<StoredValue, StoreError> {
    let record = StoredValue::new(value, &opts);
    let bytes =
      serde_json::to_vec_pretty(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
    tokio::fs::write(self.path_for(key), bytes)
      .await
      .map_err(|e| StoreError::Io(e.to_string()))?;
    Ok(record)
  }

  async fn delete(&self, key: &str) -> Result<(), StoreError> {
    match tokio::fs::remove_file(self.path_for(key)).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
      Err(e) => Err(StoreError::Io(e.to_string())),
    }
  }
}

/// Checkpoint store writing `<execution_id>.checkpoint.json` files.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
  dir: PathBuf,
}

impl FileCheckpointStore {
  pub fn new(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
    let dir = dir.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir).map_err(|e| CheckpointError::Storage(e.to_string()))?;
    Ok(Self { dir })
  }

  fn path_for(&self, execution_id: &str) -> PathBuf {
    self
      .dir
      .join(format!("{}.checkpoint.json", file_stem(execution_id)))
  }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
  async fn save(
    &self,
    execution_id: &str,
    snapshot: &serde_json::Value,
  ) -> Result<(), CheckpointError> {
    let bytes =
      serde_json::to_vec(snapshot).map_err(|e| CheckpointError::Serialization(e.to_string()))?;
    // Write then rename so a crash never leaves a half-written snapshot behind.
    let path = self.path_for(execution_id);
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
      .await
      .map_err(|e| CheckpointError::Storage(e.to_string()))?;
    tokio::fs::rename(&tmp, &path)
      .await
      .map_err(|e| CheckpointError::Storage(e.to_string()))
  }

  async fn load(&self, execution_id: &str) -> Result<Option<serde_json::Value>, CheckpointError> {
    let bytes = match tokio::fs::read(self.path_for(execution_id)).await {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(CheckpointError::Storage(e.to_string())),
    };

    let snapshot = serde_json::from_slice::<serde_json::Value>(&bytes)
      .map_err(|e| CheckpointError::Corrupted(e.to_string()))?;
    Ok(Some(snapshot))
  }

  async fn delete(&self, execution_id: &str) -> Result<(), CheckpointError> {
    let _ = tokio::fs::remove_file(self.path_for(execution_id)).await;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_file_stem_escapes_separators() {
    assert_eq!(file_stem("users/42:profile"), "users_2f42_3aprofile");
    assert_eq!(file_stem("plain-key.v1"), "plain-key.v1");
  }

  #[tokio::test]
  async fn test_file_kv_distinguishes_not_found_from_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileKvStore::new(dir.path()).unwrap();

    assert!(matches!(
      store.get("missing").await.unwrap_err(),
      StoreError::NotFound(_)
    ));

    store
      .put("users/1", json!({"name": "ada"}), PutOptions::default())
      .await
      .unwrap();
    assert_eq!(store.get("users/1").await.unwrap().value["name"], "ada");

    std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
    assert!(matches!(
      store.get("broken").await.unwrap_err(),
      StoreError::Serialization(_)
    ));

    store.delete("users/1").await.unwrap();
    assert!(matches!(
      store.delete("users/1").await.unwrap_err(),
      StoreError::NotFound(_)
    ));
  }

  #[tokio::test]
  async fn test_file_checkpoint_roundtrip_and_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path()).unwrap();

    assert!(store.load("exec-1").await.unwrap().is_none());

    store.save("exec-1", &json!({"completed": ["a"]})).await.unwrap();
    let loaded = store.load("exec-1").await.unwrap().unwrap();
    assert_eq!(loaded["completed"][0], "a");

    std::fs::write(dir.path().join("exec-2.checkpoint.json"), b"garbage").unwrap();
    assert!(matches!(
      store.load("exec-2").await.unwrap_err(),
      CheckpointError::Corrupted(_)
    ));

    store.delete("exec-1").await.unwrap();
    assert!(store.load("exec-1").await.unwrap().is_none());
  }
}
