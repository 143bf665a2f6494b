use serde::{Deserialize, Serialize};

use crate::enums::{ExecutionMode, RetryBackoff};

/// Run-wide scheduling, budget and checkpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
  pub execution_mode: ExecutionMode,
  pub max_parallel_executions: usize,
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
  /// Fraction of `max_cost_usd` at which a budget warning is emitted.
  pub cost_warning_threshold: f64,
  pub continue_on_error: bool,
  pub enable_checkpoints: bool,
  /// Minimum spacing between checkpoints; every completion when absent.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub checkpoint_interval_ms: Option<u64>,
}

impl Default for WorkflowSettings {
  fn default() -> Self {
    Self {
      execution_mode: ExecutionMode::default(),
      max_parallel_executions: 5,
      max_execution_time_ms: Some(300_000),
      max_total_tokens: None,
      max_cost_usd: None,
      max_api_calls: None,
      rate_limit_per_minute: None,
      cost_warning_threshold: 0.8,
      continue_on_error: false,
      enable_checkpoints: false,
      checkpoint_interval_ms: None,
    }
  }
}

/// Backoff configuration for retried node attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Overrides the workflow's `max_retries` for this node.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_retries: Option<u32>,
  pub backoff: RetryBackoff,
  pub initial_delay_ms: u64,
  pub max_delay_ms: u64,
  pub multiplier: f64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: None,
      backoff: RetryBackoff::Exponential,
      initial_delay_ms: 1000,
      max_delay_ms: 60_000,
      multiplier: 2.0,
    }
  }
}
