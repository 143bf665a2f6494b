//! Sub-workflow nodes run another registered workflow as a nested scope.
//!
//! The child shares the run's budget, cancellation token and execution id,
//! but gets its own context seeded from the mapped input, and its own
//! settings and error policy.

use std::sync::Arc;

use serde_json::{Map, Value};
use switchyard_config::NodeKind;
use switchyard_workflow::Workflow;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::engine::{RunScope, ScopeOutcome, ScopeState, scope_output};
use crate::error::{ErrorKind, NodeExecutionError};
use crate::executors::{NodeCall, NodeOutput};
use crate::expr;
use crate::policy::ErrorPolicy;
use crate::result::NodeResult;
use crate::variables::validate_input;

pub(crate) async fn execute(
  call: &NodeCall<'_>,
  trace: &mut Vec<NodeResult>,
) -> Result<NodeOutput, NodeExecutionError> {
  let NodeKind::SubWorkflow {
    workflow_id,
    version,
    input_mapping,
    output_mapping,
  } = &call.node.kind
  else {
    return Err(NodeExecutionError::invalid_config("not a sub-workflow node"));
  };

  let scope = call.scope;
  let max_depth = scope.engine.config().max_subworkflow_depth;
  if scope.depth + 1 > max_depth {
    return Err(NodeExecutionError::invalid_config(format!(
      "sub-workflow nesting exceeds the maximum depth of {max_depth}"
    )));
  }

  let def = scope
    .collaborators()
    .workflows
    .get(workflow_id, version.as_deref())
    .await
    .map_err(|e| NodeExecutionError::collaborator(e.message, e.retryable))?
    .ok_or_else(|| {
      NodeExecutionError::new(
        ErrorKind::NotFound,
        format!("workflow not registered: {workflow_id}"),
        false,
      )
    })?;
  let child = Arc::new(Workflow::from_def(def).map_err(|e| {
    NodeExecutionError::invalid_config(format!("sub-workflow '{workflow_id}' is invalid: {e}"))
  })?);

  let snapshot = call.snapshot();
  let input = if input_mapping.is_empty() {
    call.input.clone()
  } else {
    let mut mapped = Value::Object(Map::new());
    expr::apply_mappings(&snapshot, input_mapping, &mut mapped)?;
    mapped
  };
  let variables = validate_input(&child.def().variables, &input).map_err(|e| {
    NodeExecutionError::invalid_config(format!("sub-workflow '{workflow_id}' input: {e}"))
  })?;

  let settings = child.settings().clone();
  let child_scope = RunScope {
    engine: scope.engine.clone(),
    workflow: child.clone(),
    execution_id: scope.execution_id.clone(),
    policy: Arc::new(ErrorPolicy::new(child.def(), settings.continue_on_error)),
    settings: Arc::new(settings),
    budget: scope.budget.clone(),
    slots: scope.slots.clone(),
    cancel: scope.cancel.clone(),
    depth: scope.depth + 1,
    label: scope.child_label(&format!("{}>{workflow_id}", call.node.id)),
    timeout_override_ms: scope.timeout_override_ms,
  };

  debug!(
    node_id = %call.node.id,
    workflow_id = %workflow_id,
    depth = child_scope.depth,
    "sub-workflow started"
  );
  let mut state = ScopeState::new(
    &child,
    child.top_level(),
    input.clone(),
    ExecutionContext::new(input, variables),
  );
  let outcome = scope.engine.drive(&child_scope, &mut state, None).await;
  trace.append(&mut state.results);

  match outcome {
    ScopeOutcome::Completed => {}
    ScopeOutcome::Failed { node_id, error } => {
      return Err(NodeExecutionError::new(
        error.kind,
        format!(
          "sub-workflow '{workflow_id}': node '{node_id}' failed: {}",
          error.message
        ),
        error.retryable,
      ));
    }
    ScopeOutcome::Cancelled => return Err(NodeExecutionError::cancelled()),
  }

  let child_output = scope_output(&child, &state, true);
  let output = if output_mapping.is_empty() {
    child_output
  } else {
    let mut snapshot = state.context.snapshot();
    if let Value::Object(root) = &mut snapshot {
      root.insert("output".to_string(), child_output);
    }
    let mut mapped = Value::Object(Map::new());
    expr::apply_mappings(&snapshot, output_mapping, &mut mapped)?;
    mapped
  };

  Ok(NodeOutput::new(output))
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use serde_json::json;
  use switchyard_config::WorkflowDef;

  use super::*;
  use crate::collaborators::InMemoryWorkflowRegistry;
  use crate::engine::{Collaborators, testing};
  use crate::result::NodeStatus;

  fn registry() -> Arc<InMemoryWorkflowRegistry> {
    let registry = Arc::new(InMemoryWorkflowRegistry::new());
    let child: WorkflowDef = serde_json::from_value(json!({
      "id": "greet", "name": "greet",
      "variables": [{"name": "who", "type": "string", "required": true}],
      "nodes": [
        {"id": "hello", "kind": "transform", "input": {"greeting": "hi ${vars.who}"},
          "operations": []}
      ]
    }))
    .unwrap();
    registry.register(child);
    let broken: WorkflowDef = serde_json::from_value(json!({
      "id": "broken", "name": "broken",
      "nodes": [
        {"id": "boom", "kind": "storage", "operation": "load", "key": "missing"}
      ]
    }))
    .unwrap();
    registry.register(broken);
    registry
  }

  async fn call(node: Value, input: Value) -> (Result<NodeOutput, NodeExecutionError>, Vec<NodeResult>) {
    let mut node = node;
    node["id"] = json!("sub");
    node["kind"] = json!("sub_workflow");
    let scope = testing::scope(
      json!({"id": "parent", "name": "parent", "nodes": [node]}),
      Collaborators {
        workflows: registry(),
        ..Default::default()
      },
    );
    let context = ExecutionContext::new(input.clone(), Default::default());
    let mut trace = Vec::new();
    let out = execute(
      &NodeCall {
        scope: &scope,
        node: scope.workflow.node("sub").unwrap(),
        context: &context,
        input: &input,
      },
      &mut trace,
    )
    .await;
    (out, trace)
  }

  #[tokio::test]
  async fn test_child_runs_with_mapped_input() {
    let (out, trace) = call(
      json!({
        "workflow_id": "greet",
        "input_mapping": [{"source": "input.name", "target": "who"}],
        "output_mapping": [{"source": "output.greeting", "target": "message"}]
      }),
      json!({"name": "ada"}),
    )
    .await;

    assert_eq!(out.unwrap().output, json!({"message": "hi ada"}));
    assert_eq!(trace.len(), 1);
    assert_eq!(trace[0].node_id, "hello");
    assert_eq!(trace[0].status, NodeStatus::Success);
  }

  #[tokio::test]
  async fn test_missing_workflow_and_bad_input() {
    let (out, _) = call(json!({"workflow_id": "nope"}), json!({})).await;
    assert_eq!(out.unwrap_err().kind, ErrorKind::NotFound);

    let (out, _) = call(json!({"workflow_id": "greet"}), json!({})).await;
    assert_eq!(out.unwrap_err().kind, ErrorKind::InvalidConfig);
  }

  #[tokio::test]
  async fn test_child_failure_names_the_node() {
    let (out, _) = call(json!({"workflow_id": "broken"}), json!({})).await;
    let err = out.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert!(err.message.contains("node 'boom'"), "{}", err.message);
  }
}
