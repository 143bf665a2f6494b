//! Error policy dispatch: what to do after a node attempt fails.

use std::time::Duration;

use switchyard_config::{ErrorStrategy, NodeDef, RetryBackoff, RetryConfig, WorkflowDef};

use crate::error::{ErrorKind, NodeExecutionError};

/// Outcome of a policy decision for one failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
  /// Run the node again after `delay`.
  Retry { delay: Duration },
  /// The failure is terminal for the run.
  Fail,
  /// Mark the node skipped and keep scheduling.
  Skip,
  /// Run the named handler in place of the node.
  Fallback { node_id: String },
}

/// Workflow-level error handling configuration.
#[derive(Debug, Clone)]
pub struct ErrorPolicy {
  strategy: ErrorStrategy,
  max_retries: u32,
  global_error_handler: Option<String>,
  continue_on_error: bool,
}

impl ErrorPolicy {
  pub fn new(def: &WorkflowDef, continue_on_error: bool) -> Self {
    Self {
      strategy: def.error_handling_strategy,
      max_retries: def.max_retries,
      global_error_handler: def.global_error_handler.clone(),
      continue_on_error,
    }
  }

  /// Strategy in force for `node`, resolving `custom` to the node's own.
  pub fn strategy_for(&self, node: &NodeDef) -> ErrorStrategy {
    match self.strategy {
      ErrorStrategy::Custom => match node.error_handling {
        Some(ErrorStrategy::Custom) | None => ErrorStrategy::RetryThenFail,
        Some(strategy) => strategy,
      },
      strategy => strategy,
    }
  }

  /// Decide how to react to the failure of attempt number `attempt` (1-based).
  pub fn decide(&self, node: &NodeDef, error: &NodeExecutionError, attempt: u32) -> Decision {
    if matches!(error.kind, ErrorKind::BudgetExceeded | ErrorKind::Cancelled) {
      return Decision::Fail;
    }

    let decision = match self.strategy_for(node) {
      ErrorStrategy::FailFast => Decision::Fail,
      ErrorStrategy::RetryThenFail => {
        let max_retries = node
          .retry
          .as_ref()
          .and_then(|r| r.max_retries)
          .unwrap_or(self.max_retries);
        if error.retryable && attempt <= max_retries {
          let retry = node.retry.clone().unwrap_or_default();
          Decision::Retry {
            delay: backoff_delay(&retry, attempt),
          }
        } else {
          Decision::Fail
        }
      }
      ErrorStrategy::SkipAndContinue => Decision::Skip,
      ErrorStrategy::FallbackThenContinue => {
        match self.fallback_for(node) {
          Some(node_id) => Decision::Fallback { node_id },
          None => Decision::Skip,
        }
      }
      ErrorStrategy::Custom => Decision::Fail,
    };

    if decision == Decision::Fail && self.continue_on_error {
      Decision::Skip
    } else {
      decision
    }
  }

  /// Handler for a failed node: its own fallback, else the global handler.
  pub fn fallback_for(&self, node: &NodeDef) -> Option<String> {
    node
      .fallback_node
      .clone()
      .or_else(|| self.global_error_handler.clone())
      .filter(|id| id != &node.id)
  }
}

/// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
pub fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
  let initial = retry.initial_delay_ms as f64;
  let attempt = attempt.max(1);
  let delay = match retry.backoff {
    RetryBackoff::None => 0.0,
    RetryBackoff::Constant => initial,
    RetryBackoff::Linear => initial * attempt as f64,
    RetryBackoff::Exponential => initial * retry.multiplier.powi(attempt as i32 - 1),
  };
  Duration::from_millis(delay.min(retry.max_delay_ms as f64).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use switchyard_config::NodeKind;

  fn workflow(strategy: &str) -> WorkflowDef {
    serde_json::from_value(json!({
      "id": "wf",
      "name": "wf",
      "nodes": [{"id": "a", "kind": "agent", "agent_id": "x"}],
      "error_handling_strategy": strategy,
      "max_retries": 2
    }))
    .unwrap()
  }

  fn node() -> NodeDef {
    NodeDef::new(
      "a",
      NodeKind::Agent {
        agent_id: "x".to_string(),
        instructions: None,
        instructions_override: None,
        instructions_append: None,
      },
    )
  }

  fn flaky() -> NodeExecutionError {
    NodeExecutionError::collaborator("upstream 503", true)
  }

  #[test]
  fn test_retry_then_fail_counts_attempts() {
    let policy = ErrorPolicy::new(&workflow("retry_then_fail"), false);
    let node = node();

    assert!(matches!(policy.decide(&node, &flaky(), 1), Decision::Retry { .. }));
    assert!(matches!(policy.decide(&node, &flaky(), 2), Decision::Retry { .. }));
    assert_eq!(policy.decide(&node, &flaky(), 3), Decision::Fail);

    let permanent = NodeExecutionError::collaborator("bad request", false);
    assert_eq!(policy.decide(&node, &permanent, 1), Decision::Fail);
  }

  #[test]
  fn test_node_retry_overrides_workflow_max() {
    let policy = ErrorPolicy::new(&workflow("retry_then_fail"), false);
    let mut node = node();
    node.retry = Some(RetryConfig {
      max_retries: Some(0),
      ..Default::default()
    });
    assert_eq!(policy.decide(&node, &flaky(), 1), Decision::Fail);
  }

  #[test]
  fn test_budget_and_cancel_always_fail() {
    let policy = ErrorPolicy::new(&workflow("skip_and_continue"), true);
    let node = node();
    assert_eq!(
      policy.decide(&node, &NodeExecutionError::budget("over"), 1),
      Decision::Fail
    );
    assert_eq!(
      policy.decide(&node, &NodeExecutionError::cancelled(), 1),
      Decision::Fail
    );
  }

  #[test]
  fn test_fallback_and_custom() {
    let mut def = workflow("fallback_then_continue");
    def.global_error_handler = Some("global".to_string());
    let policy = ErrorPolicy::new(&def, false);

    let mut node = node();
    assert_eq!(
      policy.decide(&node, &flaky(), 1),
      Decision::Fallback {
        node_id: "global".to_string()
      }
    );
    node.fallback_node = Some("local".to_string());
    assert_eq!(
      policy.decide(&node, &flaky(), 1),
      Decision::Fallback {
        node_id: "local".to_string()
      }
    );

    let policy = ErrorPolicy::new(&workflow("custom"), false);
    node.error_handling = Some(ErrorStrategy::SkipAndContinue);
    assert_eq!(policy.decide(&node, &flaky(), 1), Decision::Skip);
    node.error_handling = Some(ErrorStrategy::FailFast);
    assert_eq!(policy.decide(&node, &flaky(), 1), Decision::Fail);
  }

  #[test]
  fn test_continue_on_error_turns_fail_into_skip() {
    let policy = ErrorPolicy::new(&workflow("fail_fast"), true);
    assert_eq!(policy.decide(&node(), &flaky(), 1), Decision::Skip);
  }

  #[test]
  fn test_backoff_shapes() {
    let mut retry = RetryConfig {
      initial_delay_ms: 100,
      max_delay_ms: 1_000,
      multiplier: 3.0,
      ..Default::default()
    };
    assert_eq!(backoff_delay(&retry, 1), Duration::from_millis(100));
    assert_eq!(backoff_delay(&retry, 2), Duration::from_millis(300));
    assert_eq!(backoff_delay(&retry, 4), Duration::from_millis(1_000));

    retry.backoff = RetryBackoff::Linear;
    assert_eq!(backoff_delay(&retry, 3), Duration::from_millis(300));
    retry.backoff = RetryBackoff::Constant;
    assert_eq!(backoff_delay(&retry, 3), Duration::from_millis(100));
    retry.backoff = RetryBackoff::None;
    assert_eq!(backoff_delay(&retry, 3), Duration::ZERO);
  }
}
