use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use switchyard_config::{ExecutionMode, WorkflowSettings};

/// Engine-wide settings that are not part of any workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Timeout for node kinds that finish on their own (agent, transform,
  /// decision, storage, aggregator, error handler) when the node sets none.
  pub default_node_timeout_ms: u64,
  pub max_subworkflow_depth: usize,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      default_node_timeout_ms: 120_000,
      max_subworkflow_depth: 8,
    }
  }
}

/// Per-run adjustments passed to `start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOverrides {
  /// Values merged over the input payload before validation.
  #[serde(skip_serializing_if = "Map::is_empty")]
  pub variables: Map<String, Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub execution_mode: Option<ExecutionMode>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_parallel_executions: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_execution_time_ms: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_total_tokens: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_cost_usd: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_api_calls: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub rate_limit_per_minute: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub enable_checkpoints: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub continue_on_error: Option<bool>,
  /// Replaces every node's own timeout for this run.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout_override_ms: Option<u64>,
}

impl RunOverrides {
  /// Settings in force for a run of a workflow with `settings`.
  pub fn apply(&self, settings: &WorkflowSettings) -> WorkflowSettings {
    let mut settings = settings.clone();
    if let Some(mode) = self.execution_mode {
      settings.execution_mode = mode;
    }
    if let Some(max) = self.max_parallel_executions {
      settings.max_parallel_executions = max;
    }
    if self.max_execution_time_ms.is_some() {
      settings.max_execution_time_ms = self.max_execution_time_ms;
    }
    if self.max_total_tokens.is_some() {
      settings.max_total_tokens = self.max_total_tokens;
    }
    if self.max_cost_usd.is_some() {
      settings.max_cost_usd = self.max_cost_usd;
    }
    if self.max_api_calls.is_some() {
      settings.max_api_calls = self.max_api_calls;
    }
    if self.rate_limit_per_minute.is_some() {
      settings.rate_limit_per_minute = self.rate_limit_per_minute;
    }
    if let Some(enabled) = self.enable_checkpoints {
      settings.enable_checkpoints = enabled;
    }
    if let Some(enabled) = self.continue_on_error {
      settings.continue_on_error = enabled;
    }
    settings
  }

  /// Input payload with override variables merged over it.
  pub fn merge_input(&self, input: Value) -> Value {
    if self.variables.is_empty() {
      return input;
    }
    let mut map = match input {
      Value::Object(map) => map,
      Value::Null => Map::new(),
      other => return other,
    };
    for (key, value) in &self.variables {
      map.insert(key.clone(), value.clone());
    }
    Value::Object(map)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  use crate::budget::{BudgetLimits, BudgetTracker};
  use crate::error::ErrorKind;

  #[test]
  fn test_apply_only_touches_set_fields() {
    let overrides: RunOverrides = serde_json::from_value(json!({
      "execution_mode": "sequential",
      "max_total_tokens": 500
    }))
    .unwrap();

    let base = WorkflowSettings::default();
    let applied = overrides.apply(&base);
    assert_eq!(applied.execution_mode, ExecutionMode::Sequential);
    assert_eq!(applied.max_total_tokens, Some(500));
    assert_eq!(applied.max_parallel_executions, base.max_parallel_executions);
    assert_eq!(applied.max_execution_time_ms, base.max_execution_time_ms);
  }

  #[test]
  fn test_rate_limit_override_reaches_budget() {
    let overrides: RunOverrides =
      serde_json::from_value(json!({"rate_limit_per_minute": 1})).unwrap();
    let settings = overrides.apply(&WorkflowSettings::default());
    assert_eq!(settings.rate_limit_per_minute, Some(1));

    let tracker = BudgetTracker::new(BudgetLimits::from_settings(&settings));
    tracker.authorize().unwrap();
    let err = tracker.authorize().unwrap_err();
    assert_eq!(err.kind, ErrorKind::BudgetExceeded);
    assert!(err.message.contains("rate limit of 1"));
  }

  #[test]
  fn test_merge_input() {
    let mut overrides = RunOverrides::default();
    assert_eq!(overrides.merge_input(json!({"a": 1})), json!({"a": 1}));

    overrides.variables.insert("a".to_string(), json!(2));
    overrides.variables.insert("b".to_string(), json!(3));
    assert_eq!(overrides.merge_input(json!({"a": 1})), json!({"a": 2, "b": 3}));
    assert_eq!(overrides.merge_input(Value::Null), json!({"a": 2, "b": 3}));
  }
}
