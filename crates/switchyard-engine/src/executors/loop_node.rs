//! Loop nodes run their body as a fresh nested scope per iteration.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value, json};
use switchyard_config::{LoopKind, NodeKind};
use tracing::debug;

use crate::engine::{ScopeOutcome, ScopeState, scope_output};
use crate::error::NodeExecutionError;
use crate::executors::{NodeCall, NodeOutput};
use crate::expr::{self, ExprError};
use crate::result::NodeResult;

pub(crate) async fn execute(
  call: &NodeCall<'_>,
  trace: &mut Vec<NodeResult>,
) -> Result<NodeOutput, NodeExecutionError> {
  let NodeKind::Loop {
    loop_type,
    source,
    condition,
    count,
    body,
    iteration_variable,
    max_iterations,
    break_condition,
  } = &call.node.kind
  else {
    return Err(NodeExecutionError::invalid_config("not a loop node"));
  };

  let scope = call.scope;
  let node_id = &call.node.id;
  let members: HashSet<String> = body.iter().cloned().collect();
  let condition = condition.as_deref().unwrap_or("false");

  let items = match loop_type {
    LoopKind::ForEach => {
      let source = source.as_deref().unwrap_or_default();
      Some(source_items(&call.snapshot(), source)?)
    }
    _ => None,
  };

  let mut working = call.context.clone();
  let mut results: Vec<Value> = Vec::new();
  let mut owned_outputs = BTreeMap::new();
  let mut index: usize = 0;

  let terminated_by = loop {
    if index >= *max_iterations as usize {
      break "max_iterations";
    }
    let item = match (loop_type, &items) {
      (LoopKind::ForEach, Some(items)) => match items.get(index) {
        Some(item) => item.clone(),
        None => break "completed",
      },
      (LoopKind::FixedCount, _) if index >= count.unwrap_or(0) as usize => break "completed",
      _ => Value::from(index),
    };

    let locals = bindings(iteration_variable, &item, index, results.last());
    let iteration_context = working.child(locals);
    if *loop_type == LoopKind::While {
      let snapshot = iteration_context.snapshot_with_current(call.input);
      if !expr::evaluate_condition(&snapshot, condition)? {
        break "condition";
      }
    }

    debug!(node_id = %node_id, iteration = index, "loop iteration started");
    let iteration_scope = scope.nested(&format!("{node_id}[{index}]"));
    let mut state = ScopeState::new(
      &scope.workflow,
      members.clone(),
      call.input.clone(),
      iteration_context,
    );
    let outcome = scope
      .engine
      .drive(&iteration_scope, &mut state, None)
      .await;
    trace.append(&mut state.results);

    match outcome {
      ScopeOutcome::Completed => {}
      ScopeOutcome::Failed {
        node_id: failed,
        error,
      } => {
        return Err(NodeExecutionError::new(
          error.kind,
          format!("iteration {index}: node '{failed}' failed: {}", error.message),
          error.retryable,
        ));
      }
      ScopeOutcome::Cancelled => return Err(NodeExecutionError::cancelled()),
    }

    let output = scope_output(&scope.workflow, &state, false);
    working.merge_outputs(&state.context, &members);
    for id in &members {
      if let Some(out) = state.context.output(id) {
        owned_outputs.insert(id.clone(), out.clone());
      }
    }
    results.push(output);
    index += 1;

    let after = working
      .child(bindings(iteration_variable, &item, index - 1, results.last()))
      .snapshot_with_current(call.input);
    if let Some(break_condition) = break_condition {
      if expr::evaluate_condition(&after, break_condition)? {
        break "break";
      }
    }
    if *loop_type == LoopKind::Until && expr::evaluate_condition(&after, condition)? {
      break "condition";
    }
  };

  debug!(
    node_id = %node_id,
    iterations = index,
    terminated_by = terminated_by,
    "loop finished"
  );
  Ok(NodeOutput {
    output: json!({
      "iterations": index,
      "results": results,
      "terminated_by": terminated_by,
    }),
    owned_outputs,
    ..Default::default()
  })
}

fn source_items(snapshot: &Value, source: &str) -> Result<Vec<Value>, NodeExecutionError> {
  let resolved = if source.contains("${") {
    expr::interpolate(snapshot, source)?
  } else {
    expr::resolve_path(snapshot, source)
      .ok_or_else(|| ExprError::Unresolved(source.to_string()))?
  };
  match resolved {
    Value::Array(items) => Ok(items),
    Value::Null => Ok(Vec::new()),
    other => Err(NodeExecutionError::invalid_config(format!(
      "loop source '{source}' is not an array: {other}"
    ))),
  }
}

/// Locals visible to one iteration.
fn bindings(variable: &str, item: &Value, index: usize, last: Option<&Value>) -> Map<String, Value> {
  let mut locals = Map::new();
  locals.insert(variable.to_string(), item.clone());
  locals.insert("index".to_string(), Value::from(index));
  if let Some(last) = last {
    locals.insert("last".to_string(), last.clone());
  }
  locals
}
