//! Storage nodes read and write the key-value store.

use serde_json::{Value, json};
use switchyard_config::{NodeKind, StorageFormat, StorageOperation};
use switchyard_store::{KvStore, PutOptions, StoreError};

use crate::error::{ErrorKind, NodeExecutionError};
use crate::executors::{NodeCall, NodeOutput};
use crate::expr;

pub(crate) async fn execute(call: &NodeCall<'_>) -> Result<NodeOutput, NodeExecutionError> {
  let NodeKind::Storage {
    operation,
    key,
    value,
    format,
    versioned,
    ttl_seconds,
    default,
  } = &call.node.kind
  else {
    return Err(NodeExecutionError::invalid_config("not a storage node"));
  };

  let snapshot = call.snapshot();
  let key = expr::render_scalar(&expr::interpolate(&snapshot, key)?);
  let store = call.scope.collaborators().storage.as_ref();
  let payload = || -> Result<Value, NodeExecutionError> {
    let value = match value {
      Some(template) => expr::resolve_value(&snapshot, template)?,
      None => call.input.clone(),
    };
    Ok(match format {
      StorageFormat::Json => value,
      StorageFormat::Text => Value::String(expr::render_scalar(&value)),
    })
  };
  let write = |value: Value, previous: Option<u64>| Write {
    store,
    key: &key,
    value,
    opts: PutOptions {
      ttl_seconds: *ttl_seconds,
      version: versioned.then(|| previous.map_or(1, |v| v + 1)),
    },
  };

  let output = match operation {
    StorageOperation::Save => {
      let previous = if *versioned { current_version(store, &key).await? } else { None };
      write(payload()?, previous).run().await?
    }
    StorageOperation::Load => match store.get(&key).await {
      Ok(stored) => json!({ "key": key, "value": stored.value, "version": stored.version }),
      Err(StoreError::NotFound(_)) => match default {
        Some(default) => json!({ "key": key, "value": default, "found": false }),
        None => return Err(map_store_error(StoreError::NotFound(key.clone()))),
      },
      Err(e) => return Err(map_store_error(e)),
    },
    StorageOperation::Update => {
      let stored = store.get(&key).await.map_err(map_store_error)?;
      let merged = match (stored.value, payload()?) {
        (Value::Object(mut current), Value::Object(patch)) => {
          current.extend(patch);
          Value::Object(current)
        }
        (_, replacement) => replacement,
      };
      write(merged, Some(stored.version)).run().await?
    }
    StorageOperation::Append => {
      let (current, version) = match store.get(&key).await {
        Ok(stored) => (stored.value, Some(stored.version)),
        Err(StoreError::NotFound(_)) => (Value::Array(Vec::new()), None),
        Err(e) => return Err(map_store_error(e)),
      };
      let appended = match (current, payload()?) {
        (Value::Array(mut items), value) => {
          items.push(value);
          Value::Array(items)
        }
        (Value::String(s), value) => Value::String(s + &expr::render_scalar(&value)),
        (other, _) => {
          return Err(NodeExecutionError::new(
            ErrorKind::InvalidConfig,
            format!("cannot append to '{key}': stored value is {}", kind_of(&other)),
            false,
          ));
        }
      };
      write(appended, version).run().await?
    }
    StorageOperation::Delete => match store.delete(&key).await {
      Ok(()) => json!({ "key": key, "deleted": true }),
      Err(StoreError::NotFound(_)) => json!({ "key": key, "deleted": false }),
      Err(e) => return Err(map_store_error(e)),
    },
  };

  Ok(NodeOutput::new(output))
}

struct Write<'a> {
  store: &'a dyn KvStore,
  key: &'a str,
  value: Value,
  opts: PutOptions,
}

impl Write<'_> {
  async fn run(self) -> Result<Value, NodeExecutionError> {
    let stored = self
      .store
      .put(self.key, self.value, self.opts)
      .await
      .map_err(map_store_error)?;
    Ok(json!({ "key": self.key, "value": stored.value, "version": stored.version }))
  }
}

async fn current_version(store: &dyn KvStore, key: &str) -> Result<Option<u64>, NodeExecutionError> {
  match store.get(key).await {
    Ok(stored) => Ok(Some(stored.version)),
    Err(StoreError::NotFound(_)) => Ok(None),
    Err(e) => Err(map_store_error(e)),
  }
}

fn map_store_error(err: StoreError) -> NodeExecutionError {
  match err {
    StoreError::NotFound(key) => {
      NodeExecutionError::new(ErrorKind::NotFound, format!("key not found: {key}"), false)
    }
    StoreError::Io(message) => NodeExecutionError::new(ErrorKind::Storage, message, true),
    StoreError::Serialization(message) => {
      NodeExecutionError::new(ErrorKind::Storage, message, false)
    }
  }
}

fn kind_of(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use switchyard_store::MemoryKvStore;

  use super::*;
  use crate::context::ExecutionContext;
  use crate::engine::{Collaborators, testing};

  async fn op(store: &Arc<MemoryKvStore>, node: Value, input: Value) -> Result<Value, NodeExecutionError> {
    let mut node = node;
    node["id"] = json!("s");
    node["kind"] = json!("storage");
    let scope = testing::scope(
      json!({"id": "wf", "name": "store", "nodes": [node]}),
      Collaborators {
        storage: store.clone(),
        ..Default::default()
      },
    );
    let context = ExecutionContext::new(json!({"user": "u1"}), Default::default());
    execute(&NodeCall {
      scope: &scope,
      node: scope.workflow.node("s").unwrap(),
      context: &context,
      input: &input,
    })
    .await
    .map(|out| out.output)
  }

  #[tokio::test]
  async fn test_versioned_save_then_load() {
    let store = Arc::new(MemoryKvStore::new());
    let save = json!({"operation": "save", "key": "profile:${input.user}", "versioned": true});

    let first = op(&store, save.clone(), json!({"name": "a"})).await.unwrap();
    assert_eq!(first["version"], 1);
    let second = op(&store, save, json!({"name": "b"})).await.unwrap();
    assert_eq!(second["version"], 2);
    assert_eq!(second["key"], "profile:u1");

    let loaded = op(&store, json!({"operation": "load", "key": "profile:u1"}), Value::Null)
      .await
      .unwrap();
    assert_eq!(loaded["value"], json!({"name": "b"}));
  }

  #[tokio::test]
  async fn test_load_missing_uses_default_or_fails() {
    let store = Arc::new(MemoryKvStore::new());
    let loaded = op(
      &store,
      json!({"operation": "load", "key": "nope", "default": []}),
      Value::Null,
    )
    .await
    .unwrap();
    assert_eq!(loaded["value"], json!([]));

    let err = op(&store, json!({"operation": "load", "key": "nope"}), Value::Null)
      .await
      .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
  }

  #[tokio::test]
  async fn test_update_append_delete() {
    let store = Arc::new(MemoryKvStore::new());
    op(&store, json!({"operation": "save", "key": "k"}), json!({"a": 1, "b": 1}))
      .await
      .unwrap();
    let updated = op(&store, json!({"operation": "update", "key": "k", "value": {"b": 2}}), Value::Null)
      .await
      .unwrap();
    assert_eq!(updated["value"], json!({"a": 1, "b": 2}));

    let err = op(&store, json!({"operation": "update", "key": "missing"}), json!({}))
      .await
      .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    op(&store, json!({"operation": "append", "key": "log"}), json!("one"))
      .await
      .unwrap();
    let appended = op(&store, json!({"operation": "append", "key": "log"}), json!("two"))
      .await
      .unwrap();
    assert_eq!(appended["value"], json!(["one", "two"]));

    let deleted = op(&store, json!({"operation": "delete", "key": "log"}), Value::Null)
      .await
      .unwrap();
    assert_eq!(deleted, json!({"key": "log", "deleted": true}));
    let again = op(&store, json!({"operation": "delete", "key": "log"}), Value::Null)
      .await
      .unwrap();
    assert_eq!(again["deleted"], false);
  }

  #[tokio::test]
  async fn test_text_format_renders_scalar() {
    let store = Arc::new(MemoryKvStore::new());
    let saved = op(
      &store,
      json!({"operation": "save", "key": "t", "format": "text", "value": "hello ${input.user}"}),
      Value::Null,
    )
    .await
    .unwrap();
    assert_eq!(saved["value"], "hello u1");

    let saved = op(&store, json!({"operation": "save", "key": "n", "format": "text"}), json!({"x": 1}))
      .await
      .unwrap();
    assert_eq!(saved["value"], r#"{"x":1}"#);
  }
}
