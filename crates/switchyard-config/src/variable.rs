use serde::{Deserialize, Serialize};

use crate::enums::{VariableScope, VariableType};

/// A declared workflow variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDef {
  pub name: String,
  #[serde(rename = "type", default)]
  pub var_type: VariableType,
  #[serde(default)]
  pub required: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub validation: Option<ValidationRule>,
  #[serde(default)]
  pub scope: VariableScope,
  /// Context path an `output` variable is read from when the run ends.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRule {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pattern: Option<String>,
  #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
  pub allowed: Option<Vec<serde_json::Value>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub minimum: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub maximum: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub min_length: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_length: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub min_items: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_items: Option<usize>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub required_keys: Vec<String>,
}
