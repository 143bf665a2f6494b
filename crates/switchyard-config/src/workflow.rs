use serde::{Deserialize, Serialize};

use crate::edge::EdgeDef;
use crate::enums::ErrorStrategy;
use crate::node::NodeDef;
use crate::settings::WorkflowSettings;
use crate::variable::VariableDef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
  pub id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
  pub nodes: Vec<NodeDef>,
  #[serde(default)]
  pub edges: Vec<EdgeDef>,
  #[serde(default)]
  pub variables: Vec<VariableDef>,
  #[serde(default)]
  pub settings: WorkflowSettings,
  #[serde(default)]
  pub error_handling_strategy: ErrorStrategy,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Error-handler node consulted when a failing node names no fallback.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub global_error_handler: Option<String>,
}

fn default_max_retries() -> u32 {
  3
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{ExecutionMode, LoopKind, NodeKind, StorageOperation, TransformOp, WaitStrategy};
  use serde_json::json;

  #[test]
  fn test_parse_minimal_workflow_applies_defaults() {
    let def: WorkflowDef = serde_json::from_value(json!({
      "id": "wf",
      "name": "Minimal",
      "nodes": [
        { "id": "greet", "kind": "agent", "agent_id": "greeter" }
      ]
    }))
    .unwrap();

    assert_eq!(def.max_retries, 3);
    assert_eq!(def.error_handling_strategy, ErrorStrategy::RetryThenFail);
    assert_eq!(def.settings.execution_mode, ExecutionMode::Parallel);
    assert_eq!(def.settings.max_parallel_executions, 5);
    assert_eq!(def.settings.max_execution_time_ms, Some(300_000));
    assert!(def.edges.is_empty());
    assert!(matches!(def.nodes[0].kind, NodeKind::Agent { .. }));
  }

  #[test]
  fn test_parse_kind_specific_config() {
    let def: WorkflowDef = serde_json::from_value(json!({
      "id": "wf",
      "name": "Kinds",
      "nodes": [
        {
          "id": "each",
          "kind": "loop",
          "loop_type": "for_each",
          "source": "input.items",
          "body": ["work"],
          "timeout_ms": 5000
        },
        { "id": "work", "kind": "transform", "operations": [
          { "op": "set", "path": "done", "value": true },
          { "op": "rename", "from": "a", "to": "b" }
        ]},
        {
          "id": "fan",
          "kind": "parallel",
          "branches": [{ "id": "left", "nodes": ["save"] }],
          "wait_strategy": "wait_first_n",
          "wait_count": 1
        },
        { "id": "save", "kind": "storage", "operation": "save", "key": "k" },
        { "id": "gate", "kind": "human_in_loop", "prompt": "ok?" }
      ],
      "edges": [
        { "source_id": "each", "target_id": "fan", "condition": "true", "priority": 2 }
      ]
    }))
    .unwrap();

    let NodeKind::Loop {
      loop_type,
      iteration_variable,
      max_iterations,
      ..
    } = &def.nodes[0].kind
    else {
      panic!("expected loop node");
    };
    assert_eq!(*loop_type, LoopKind::ForEach);
    assert_eq!(iteration_variable, "item");
    assert_eq!(*max_iterations, 1000);
    assert_eq!(def.nodes[0].timeout_ms, Some(5000));

    let NodeKind::Transform { operations, .. } = &def.nodes[1].kind else {
      panic!("expected transform node");
    };
    assert_eq!(
      operations[1],
      TransformOp::Rename {
        from: "a".to_string(),
        to: "b".to_string()
      }
    );

    let NodeKind::Parallel {
      branches,
      wait_strategy,
      ..
    } = &def.nodes[2].kind
    else {
      panic!("expected parallel node");
    };
    assert_eq!(*wait_strategy, WaitStrategy::WaitFirstN);
    assert!(branches[0].required);

    assert!(matches!(
      def.nodes[3].kind,
      NodeKind::Storage {
        operation: StorageOperation::Save,
        ..
      }
    ));

    let NodeKind::HumanInLoop { options, .. } = &def.nodes[4].kind else {
      panic!("expected human node");
    };
    assert_eq!(options, &["approve", "reject", "modify"]);

    assert_eq!(def.edges[0].priority, 2);
    assert_eq!(def.edges[0].condition.as_deref(), Some("true"));
  }

  #[test]
  fn test_unknown_kind_is_rejected() {
    let result: Result<WorkflowDef, _> = serde_json::from_value(json!({
      "id": "wf",
      "name": "Bad",
      "nodes": [{ "id": "x", "kind": "teleport" }]
    }));
    assert!(result.is_err());
  }
}
