//! Node attempt lifecycle: budget check, cache, timeout, retries and
//! fallback handlers.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use switchyard_config::{NodeDef, NodeKind};
use switchyard_store::PutOptions;
use tracing::{debug, error, info, instrument, warn};

use crate::context::ExecutionContext;
use crate::engine::RunScope;
use crate::error::{ErrorKind, NodeExecutionError};
use crate::events::ExecutionEvent;
use crate::executors::{self, NodeCall, NodeOutput};
use crate::policy::Decision;
use crate::result::{NodeResult, NodeStatus, Route};

/// Handler chains longer than this are cut off.
const MAX_FALLBACK_HOPS: usize = 2;

/// Everything one node run produced: its attempts and the final outcome.
#[derive(Debug)]
pub(crate) struct NodeRun {
  pub node_id: String,
  pub results: Vec<NodeResult>,
  pub outcome: NodeOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeOutcome {
  Completed {
    output: Value,
    route: Option<Route>,
    owned_outputs: BTreeMap<String, Value>,
  },
  Skipped,
  Failed {
    error: NodeExecutionError,
  },
  Cancelled,
}

/// Run a node to a final outcome, applying the error policy between
/// attempts.
#[instrument(
  name = "task_execute",
  skip(scope, node, context, input),
  fields(
    execution_id = %scope.execution_id,
    node_id = %node.id,
    kind = node.kind.name(),
  )
)]
pub(crate) async fn run_node(
  scope: RunScope,
  node: NodeDef,
  context: ExecutionContext,
  input: Result<Value, NodeExecutionError>,
) -> NodeRun {
  let mut results = Vec::new();
  let outcome = run_attempts(&scope, &node, &context, input, &mut results).await;
  NodeRun {
    node_id: node.id,
    results,
    outcome,
  }
}

async fn run_attempts(
  scope: &RunScope,
  node: &NodeDef,
  context: &ExecutionContext,
  input: Result<Value, NodeExecutionError>,
  results: &mut Vec<NodeResult>,
) -> NodeOutcome {
  let mut attempt = 0u32;

  loop {
    attempt += 1;
    info!(attempt = attempt, scope = %scope.label, "task_started");
    scope.notify(ExecutionEvent::NodeStarted {
      execution_id: scope.execution_id.clone(),
      node_id: node.id.clone(),
      attempt,
    });

    let started_at = Utc::now();
    let mut trace = Vec::new();
    let result = match &input {
      Ok(input) => attempt_node(scope, node, context, input, &mut trace).await,
      Err(e) => Err(e.clone()),
    };
    results.append(&mut trace);
    let node_input = input.as_ref().cloned().unwrap_or(Value::Null);

    let error = match result {
      Ok(out) => {
        let mut result = attempt_result(scope, &node.id, attempt, &node_input, started_at);
        result.output = out.output.clone();
        result.usage = out.usage;
        result.route = out.route.clone();
        results.push(result);

        info!(attempt = attempt, output = %out.output, "task_completed");
        scope.notify(ExecutionEvent::NodeCompleted {
          execution_id: scope.execution_id.clone(),
          node_id: node.id.clone(),
          output: out.output.clone(),
        });
        return NodeOutcome::Completed {
          output: out.output,
          route: out.route,
          owned_outputs: out.owned_outputs,
        };
      }
      Err(error) => error,
    };

    if error.kind == ErrorKind::Cancelled {
      warn!(attempt = attempt, "task_cancelled");
      return NodeOutcome::Cancelled;
    }

    let mut result = attempt_result(scope, &node.id, attempt, &node_input, started_at);
    result.status = NodeStatus::Failure;
    result.error = Some(error.clone());
    results.push(result);

    error!(attempt = attempt, error = %error, "task_failed");
    scope.notify(ExecutionEvent::NodeFailed {
      execution_id: scope.execution_id.clone(),
      node_id: node.id.clone(),
      error: error.to_string(),
    });

    match scope.policy.decide(node, &error, attempt) {
      Decision::Retry { delay } => {
        let delay_ms = delay.as_millis() as u64;
        info!(attempt = attempt, delay_ms = delay_ms, "task_retrying");
        scope.notify(ExecutionEvent::NodeRetrying {
          execution_id: scope.execution_id.clone(),
          node_id: node.id.clone(),
          attempt: attempt + 1,
          delay_ms,
        });
        tokio::select! {
          _ = scope.cancel.cancelled() => return NodeOutcome::Cancelled,
          _ = tokio::time::sleep(delay) => {}
        }
      }
      Decision::Fail => return NodeOutcome::Failed { error },
      Decision::Skip => {
        skip_node(scope, node, error, results);
        return NodeOutcome::Skipped;
      }
      Decision::Fallback { node_id } => {
        return run_fallback(scope, node, context, &node_input, error, node_id, results).await;
      }
    }
  }
}

/// One attempt: authorize, consult the cache, execute under the timeout and
/// charge the budget. Only charged output is written to the cache; a cache
/// hit carries no usage.
async fn attempt_node(
  scope: &RunScope,
  node: &NodeDef,
  context: &ExecutionContext,
  input: &Value,
  trace: &mut Vec<NodeResult>,
) -> Result<NodeOutput, NodeExecutionError> {
  let _slot = if executors::is_container(&node.kind) {
    None
  } else {
    tokio::select! {
      biased;
      _ = scope.cancel.cancelled() => return Err(NodeExecutionError::cancelled()),
      permit = scope.slots.acquire() => Some(
        permit.map_err(|_| NodeExecutionError::internal("execution slots closed"))?,
      ),
    }
  };
  scope.budget.authorize()?;

  let cache_key = node
    .cache_results
    .then(|| cache_key(scope.workflow.id(), &node.id, input));
  if let Some(key) = &cache_key {
    if let Some(cached) = read_cache(scope, key).await {
      debug!(cache_key = %key, "task output served from cache");
      return Ok(cached);
    }
  }

  let call = NodeCall {
    scope,
    node,
    context,
    input,
  };
  let timeout_ms = effective_timeout(scope, node);
  let run = async {
    match timeout_ms {
      Some(ms) => {
        match tokio::time::timeout(Duration::from_millis(ms), executors::execute(&call, trace)).await
        {
          Ok(output) => output,
          Err(_) => Err(NodeExecutionError::timeout(ms)),
        }
      }
      None => executors::execute(&call, trace).await,
    }
  };

  let output = tokio::select! {
    biased;
    _ = scope.cancel.cancelled() => return Err(NodeExecutionError::cancelled()),
    output = run => output?,
  };
  let output = charge(scope, output)?;

  if let Some(key) = &cache_key {
    write_cache(scope, node, key, &output).await;
  }
  Ok(output)
}

/// Add an attempt's usage to the run budget.
fn charge(scope: &RunScope, output: NodeOutput) -> Result<NodeOutput, NodeExecutionError> {
  if output.usage.is_empty() {
    return Ok(output);
  }
  if let Some(cost_usd) = scope.budget.record(&output.usage)? {
    let max_cost_usd = scope.budget.limits().max_cost_usd.unwrap_or_default();
    warn!(
      cost_usd = cost_usd,
      max_cost_usd = max_cost_usd,
      "budget_warning"
    );
    scope.notify(ExecutionEvent::BudgetWarning {
      execution_id: scope.execution_id.clone(),
      cost_usd,
      max_cost_usd,
    });
  }
  Ok(output)
}

/// Explicit run override, then the node's own, then the engine default for
/// kinds that finish on their own.
fn effective_timeout(scope: &RunScope, node: &NodeDef) -> Option<u64> {
  scope
    .timeout_override_ms
    .or(node.timeout_ms)
    .or_else(|| {
      executors::is_bounded(&node.kind).then(|| scope.engine.config().default_node_timeout_ms)
    })
}

fn cache_key(workflow_id: &str, node_id: &str, input: &Value) -> String {
  let digest = Sha256::digest(input.to_string().as_bytes());
  format!("cache:{workflow_id}:{node_id}:{digest:x}")
}

async fn read_cache(scope: &RunScope, key: &str) -> Option<NodeOutput> {
  let stored = scope.collaborators().storage.get(key).await.ok()?;
  match serde_json::from_value(stored.value) {
    Ok(output) => Some(output),
    Err(e) => {
      warn!(cache_key = %key, error = %e, "ignoring unreadable cache entry");
      None
    }
  }
}

async fn write_cache(scope: &RunScope, node: &NodeDef, key: &str, output: &NodeOutput) {
  let value = match serde_json::to_value(output) {
    Ok(value) => value,
    Err(e) => {
      warn!(cache_key = %key, error = %e, "task output not cacheable");
      return;
    }
  };
  let opts = PutOptions {
    ttl_seconds: node.cache_ttl_seconds,
    version: None,
  };
  if let Err(e) = scope.collaborators().storage.put(key, value, opts).await {
    warn!(cache_key = %key, error = %e, "failed to cache task output");
  }
}

fn attempt_result(
  scope: &RunScope,
  node_id: &str,
  attempt: u32,
  input: &Value,
  started_at: DateTime<Utc>,
) -> NodeResult {
  NodeResult {
    task_id: uuid::Uuid::new_v4().to_string(),
    node_id: node_id.to_string(),
    scope: scope.label.clone(),
    attempt,
    status: NodeStatus::Success,
    input: input.clone(),
    output: Value::Null,
    usage: Default::default(),
    route: None,
    error: None,
    recovered_by: None,
    started_at,
    finished_at: Utc::now(),
  }
}

/// Close a node's trace with a Skipped entry carrying the error that caused it.
fn skip_node(
  scope: &RunScope,
  node: &NodeDef,
  error: NodeExecutionError,
  results: &mut Vec<NodeResult>,
) {
  info!(scope = %scope.label, error = %error, "task_skipped");
  results.push(NodeResult::skipped(&node.id, &scope.label, Some(error)));
  scope.notify(ExecutionEvent::NodeSkipped {
    execution_id: scope.execution_id.clone(),
    node_id: node.id.clone(),
  });
}

/// Run error handlers in place of a failed node.
///
/// The handler sees `error` and `failed_node` bound in its context and
/// receives the failed node's input. A handler whose `error_types` do not
/// cover the error passes it on to its own `fallback_target`, as does a
/// handler that fails.
async fn run_fallback(
  scope: &RunScope,
  failed: &NodeDef,
  context: &ExecutionContext,
  input: &Value,
  error: NodeExecutionError,
  first_handler: String,
  results: &mut Vec<NodeResult>,
) -> NodeOutcome {
  let mut next = Some(first_handler);
  let mut last_error = error.clone();

  for _ in 0..MAX_FALLBACK_HOPS {
    let Some(handler_id) = next.take() else {
      break;
    };
    let Some(handler) = scope.workflow.node(&handler_id) else {
      warn!(handler = %handler_id, "fallback handler does not exist");
      break;
    };

    let passes_on = match &handler.kind {
      NodeKind::ErrorHandler {
        error_types,
        fallback_target,
        ..
      } => {
        let accepts = error_types.is_empty() || error_types.iter().any(|t| t == error.kind.as_str());
        (!accepts).then(|| fallback_target.clone())
      }
      _ => None,
    };
    if let Some(target) = passes_on {
      debug!(handler = %handler_id, kind = %error.kind, "handler does not accept this error kind");
      next = target;
      continue;
    }

    info!(handler = %handler_id, error = %error, "task_fallback");
    let mut locals = Map::new();
    locals.insert(
      "error".to_string(),
      serde_json::to_value(&error).unwrap_or(Value::Null),
    );
    locals.insert("failed_node".to_string(), Value::String(failed.id.clone()));
    let handler_context = context.child(locals);

    let started_at = Utc::now();
    let mut trace = Vec::new();
    let attempt = attempt_node(scope, handler, &handler_context, input, &mut trace).await;
    results.append(&mut trace);

    match attempt {
      Ok(out) => {
        let mut handled = attempt_result(scope, &handler.id, 1, input, started_at);
        handled.output = out.output.clone();
        handled.usage = out.usage;
        results.push(handled);

        let mut recovered = attempt_result(scope, &failed.id, 0, input, started_at);
        recovered.output = out.output.clone();
        recovered.error = Some(error);
        recovered.recovered_by = Some(handler.id.clone());
        results.push(recovered);

        info!(handler = %handler.id, output = %out.output, "task_recovered");
        scope.notify(ExecutionEvent::NodeCompleted {
          execution_id: scope.execution_id.clone(),
          node_id: failed.id.clone(),
          output: out.output.clone(),
        });

        let mut owned_outputs = out.owned_outputs;
        owned_outputs.insert(handler.id.clone(), out.output.clone());
        return NodeOutcome::Completed {
          output: out.output,
          route: None,
          owned_outputs,
        };
      }
      Err(e) if e.kind == ErrorKind::Cancelled => return NodeOutcome::Cancelled,
      Err(e) => {
        error!(handler = %handler.id, error = %e, "fallback handler failed");
        let mut handled = attempt_result(scope, &handler.id, 1, input, started_at);
        handled.status = NodeStatus::Failure;
        handled.error = Some(e.clone());
        results.push(handled);

        last_error = e;
        next = match &handler.kind {
          NodeKind::ErrorHandler {
            fallback_target, ..
          } => fallback_target.clone(),
          _ => None,
        };
      }
    }
  }

  if scope.settings.continue_on_error {
    skip_node(scope, failed, last_error, results);
    NodeOutcome::Skipped
  } else {
    NodeOutcome::Failed { error: last_error }
  }
}
