//! Decision nodes pick exactly one downstream target.

use std::borrow::Cow;

use serde_json::json;
use switchyard_config::{ConditionBranch, NodeKind};

use crate::error::{ErrorKind, NodeExecutionError};
use crate::expr;
use crate::executors::{NodeCall, NodeOutput};
use crate::result::Route;

pub(crate) fn execute(call: &NodeCall<'_>) -> Result<NodeOutput, NodeExecutionError> {
  let NodeKind::Decision {
    branches,
    default_target,
  } = &call.node.kind
  else {
    return Err(NodeExecutionError::invalid_config("not a decision node"));
  };

  let graph = call.scope.workflow.graph();
  let outgoing = graph.outgoing(&call.node.id);

  // Without configured branches the conditioned outgoing edges act as branches.
  let mut candidates: Vec<Cow<'_, ConditionBranch>> = if branches.is_empty() {
    outgoing
      .iter()
      .map(|idx| graph.edge(*idx))
      .filter_map(|edge| {
        edge.condition.as_ref().map(|condition| {
          Cow::Owned(ConditionBranch {
            name: None,
            expression: condition.clone(),
            target: edge.target_id.clone(),
            priority: edge.priority,
          })
        })
      })
      .collect()
  } else {
    branches.iter().map(Cow::Borrowed).collect()
  };
  candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

  let snapshot = call.snapshot();
  for branch in &candidates {
    if expr::evaluate_condition(&snapshot, &branch.expression)? {
      return Ok(chosen(branch.name.as_deref(), &branch.target));
    }
  }

  if let Some(target) = default_target {
    return Ok(chosen(Some("default"), target));
  }
  let unconditioned = outgoing
    .iter()
    .map(|idx| graph.edge(*idx))
    .find(|edge| edge.condition.is_none());
  if let Some(edge) = unconditioned {
    return Ok(chosen(Some("default"), &edge.target_id));
  }

  Err(NodeExecutionError::new(
    ErrorKind::NoBranchMatched,
    format!(
      "no branch of decision '{}' matched and no default is set",
      call.node.id
    ),
    false,
  ))
}

fn chosen(name: Option<&str>, target: &str) -> NodeOutput {
  NodeOutput {
    output: json!({ "branch": name, "target": target }),
    route: Some(Route::Only {
      target: target.to_string(),
    }),
    ..Default::default()
  }
}
