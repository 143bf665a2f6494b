use serde::{Deserialize, Serialize};

/// A directed link between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDef {
  pub source_id: String,
  pub target_id: String,
  /// Expression that must evaluate true for the edge to be traversed.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub condition: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub data_mapping: Vec<DataMapping>,
  #[serde(default)]
  pub priority: i32,
}

/// Copies a value from the execution context into the target node's input.
///
/// `source` is a context path (`nodes.fetch.output.items[0]`) or a `${..}`
/// template; `target` is a dotted path inside the input object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMapping {
  pub source: String,
  pub target: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub transform: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<serde_json::Value>,
  #[serde(default)]
  pub required: bool,
}
