use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A record held by a [`KvStore`](crate::KvStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
  pub value: serde_json::Value,
  pub version: u64,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
  pub(crate) fn new(value: serde_json::Value, opts: &PutOptions) -> Self {
    let now = Utc::now();
    Self {
      value,
      version: opts.version.unwrap_or(0),
      updated_at: now,
      expires_at: opts
        .ttl_seconds
        .map(|ttl| now + chrono::Duration::seconds(ttl as i64)),
    }
  }

  pub fn is_expired(&self) -> bool {
    self.expires_at.is_some_and(|at| at <= Utc::now())
  }
}

/// Options for [`KvStore::put`](crate::KvStore::put).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PutOptions {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ttl_seconds: Option<u64>,
  /// Version tag recorded with the value.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub version: Option<u64>,
}
