//! Parallel nodes run each branch as an isolated nested scope.
//!
//! `wait_all` and `wait_timeout` wait for every branch and fail as soon as
//! a required branch fails. `wait_any` and `wait_first_n` resolve once
//! enough branches succeeded. Branches still running when the node
//! resolves are cancelled and their unfinished nodes recorded as skipped.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Map, Value, json};
use switchyard_config::{NodeKind, ParallelBranch, WaitStrategy};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{RunScope, ScopeOutcome, ScopeState, guarded, scope_output};
use crate::error::{ErrorKind, NodeExecutionError};
use crate::executors::{NodeCall, NodeOutput};
use crate::result::NodeResult;
use crate::scheduler::NodeState;

type BranchRun = (usize, Result<(ScopeOutcome, ScopeState), NodeExecutionError>);

#[derive(Debug, Clone, Copy, PartialEq)]
enum BranchStatus {
  Running,
  Completed,
  Failed,
  Cancelled,
}

pub(crate) async fn execute(
  call: &NodeCall<'_>,
  trace: &mut Vec<NodeResult>,
) -> Result<NodeOutput, NodeExecutionError> {
  let NodeKind::Parallel {
    branches,
    wait_strategy,
    wait_count,
    deadline_ms,
  } = &call.node.kind
  else {
    return Err(NodeExecutionError::invalid_config("not a parallel node"));
  };

  let scope = call.scope;
  let total = branches.len();
  let quorum = match wait_strategy {
    WaitStrategy::WaitAny => Some(1),
    WaitStrategy::WaitFirstN => Some(wait_count.unwrap_or(1).clamp(1, total.max(1))),
    WaitStrategy::WaitAll | WaitStrategy::WaitTimeout => None,
  };
  let deadline = match wait_strategy {
    WaitStrategy::WaitTimeout => deadline_ms.map(Duration::from_millis),
    _ => None,
  };

  let mut running: JoinSet<BranchRun> = JoinSet::new();
  let mut tokens = Vec::with_capacity(total);
  let mut labels = Vec::with_capacity(total);
  for (idx, branch) in branches.iter().enumerate() {
    let token = scope.cancel.child_token();
    let mut branch_scope = scope.nested(&format!("{}/{}", call.node.id, branch.id));
    branch_scope.cancel = token.clone();
    labels.push(branch_scope.label.clone());
    tokens.push(token);

    let mut locals = Map::new();
    locals.insert("branch".to_string(), Value::String(branch.id.clone()));
    let mut state = ScopeState::new(
      &scope.workflow,
      branch.nodes.iter().cloned().collect(),
      call.input.clone(),
      call.context.child(locals),
    );
    running.spawn(guarded(idx, async move {
      let outcome = branch_scope
        .engine
        .drive(&branch_scope, &mut state, None)
        .await;
      (outcome, state)
    }));
  }

  let mut status = vec![BranchStatus::Running; total];
  let mut outputs = Map::new();
  let mut owned_outputs = BTreeMap::new();
  let mut last_error: Option<NodeExecutionError> = None;

  let sleep = tokio::time::sleep(deadline.unwrap_or(Duration::MAX));
  tokio::pin!(sleep);

  loop {
    let successes = count(&status, BranchStatus::Completed);
    let unfinished = count(&status, BranchStatus::Running);
    match quorum {
      Some(needed) if successes >= needed => break,
      Some(needed) if successes + unfinished < needed => {
        cancel_all(&tokens, &mut running, trace, &labels).await;
        let cause = last_error.unwrap_or_else(|| NodeExecutionError::internal("branch failed"));
        return Err(NodeExecutionError::new(
          cause.kind,
          format!("only {successes} of {needed} required branches completed: {}", cause.message),
          cause.retryable,
        ));
      }
      None if unfinished == 0 => break,
      _ => {}
    }

    let joined = tokio::select! {
      biased;
      _ = scope.cancel.cancelled() => {
        running.shutdown().await;
        return Err(NodeExecutionError::cancelled());
      }
      _ = &mut sleep, if deadline.is_some() => {
        debug!(node_id = %call.node.id, "parallel deadline reached");
        break;
      }
      joined = running.join_next() => joined,
    };
    let Some(joined) = joined else {
      break;
    };

    let (idx, run) = match joined {
      Ok(run) => run,
      Err(e) => {
        warn!(node_id = %call.node.id, error = %e, "parallel branch task aborted");
        continue;
      }
    };
    let (outcome, mut state) = match run {
      Ok(run) => run,
      Err(error) => {
        status[idx] = BranchStatus::Failed;
        if quorum.is_none() && branches[idx].required {
          cancel_all(&tokens, &mut running, trace, &labels).await;
          return Err(error);
        }
        last_error = Some(error);
        continue;
      }
    };
    trace.append(&mut state.results);
    let branch = &branches[idx];

    match outcome {
      ScopeOutcome::Completed => {
        status[idx] = BranchStatus::Completed;
        collect(&scope.workflow, branch, &state, &mut outputs, &mut owned_outputs);
      }
      ScopeOutcome::Failed { node_id, error } => {
        status[idx] = BranchStatus::Failed;
        warn!(
          node_id = %call.node.id,
          branch = %branch.id,
          failed_node = %node_id,
          error = %error,
          "parallel branch failed"
        );
        let error = NodeExecutionError::new(
          error.kind,
          format!("branch '{}': node '{node_id}' failed: {}", branch.id, error.message),
          error.retryable,
        );
        let fatal = error.is_budget_exceeded() || (quorum.is_none() && branch.required);
        if fatal {
          cancel_all(&tokens, &mut running, trace, &labels).await;
          return Err(error);
        }
        last_error = Some(error);
      }
      ScopeOutcome::Cancelled => status[idx] = BranchStatus::Cancelled,
    }
  }

  // Resolved: stop whatever is still running and keep its partial trace.
  for (idx, token) in tokens.iter().enumerate() {
    if status[idx] == BranchStatus::Running {
      token.cancel();
    }
  }
  while let Some(joined) = running.join_next().await {
    let Ok((idx, Ok((outcome, mut state)))) = joined else {
      continue;
    };
    trace.append(&mut state.results);
    if outcome == ScopeOutcome::Completed {
      status[idx] = BranchStatus::Completed;
      collect(&scope.workflow, &branches[idx], &state, &mut outputs, &mut owned_outputs);
    } else {
      status[idx] = BranchStatus::Cancelled;
      record_unfinished(trace, &labels[idx], &state);
    }
  }

  if deadline.is_some() {
    let missing: Vec<&str> = branches
      .iter()
      .zip(&status)
      .filter(|(b, s)| b.required && **s != BranchStatus::Completed)
      .map(|(b, _)| b.id.as_str())
      .collect();
    if !missing.is_empty() {
      return Err(NodeExecutionError::new(
        ErrorKind::Timeout,
        format!(
          "required branches did not finish before the deadline: {}",
          missing.join(", ")
        ),
        true,
      ));
    }
  }

  let ids = |wanted: BranchStatus| -> Vec<&str> {
    branches
      .iter()
      .zip(&status)
      .filter(|(_, s)| **s == wanted)
      .map(|(b, _)| b.id.as_str())
      .collect()
  };
  Ok(NodeOutput {
    output: json!({
      "branches": outputs,
      "completed": ids(BranchStatus::Completed),
      "cancelled": ids(BranchStatus::Cancelled),
      "failed": ids(BranchStatus::Failed),
    }),
    owned_outputs,
    ..Default::default()
  })
}

fn count(status: &[BranchStatus], wanted: BranchStatus) -> usize {
  status.iter().filter(|s| **s == wanted).count()
}

fn collect(
  workflow: &switchyard_workflow::Workflow,
  branch: &ParallelBranch,
  state: &ScopeState,
  outputs: &mut Map<String, Value>,
  owned_outputs: &mut BTreeMap<String, Value>,
) {
  outputs.insert(branch.id.clone(), scope_output(workflow, state, false));
  for id in &branch.nodes {
    if let Some(out) = state.context.output(id) {
      owned_outputs.insert(id.clone(), out.clone());
    }
  }
}

/// Mark the nodes a cancelled branch never finished as skipped.
fn record_unfinished(trace: &mut Vec<NodeResult>, label: &str, state: &ScopeState) {
  let unfinished = state
    .scheduler
    .nodes_in(NodeState::Pending)
    .into_iter()
    .chain(state.scheduler.nodes_in(NodeState::Running));
  for node_id in unfinished {
    trace.push(NodeResult::skipped(
      &node_id,
      label,
      Some(NodeExecutionError::cancelled()),
    ));
  }
}

/// Cancel every branch and wait for them, keeping their partial traces.
async fn cancel_all(
  tokens: &[CancellationToken],
  running: &mut JoinSet<BranchRun>,
  trace: &mut Vec<NodeResult>,
  labels: &[String],
) {
  for token in tokens {
    token.cancel();
  }
  while let Some(joined) = running.join_next().await {
    if let Ok((idx, Ok((outcome, mut state)))) = joined {
      trace.append(&mut state.results);
      if outcome != ScopeOutcome::Completed {
        record_unfinished(trace, &labels[idx], &state);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use async_trait::async_trait;

  use super::*;
  use crate::collaborators::{AgentInvoker, AgentRequest, AgentResponse, CollaboratorError};
  use crate::context::ExecutionContext;
  use crate::engine::{Collaborators, testing};
  use crate::result::NodeStatus;

  /// Sleeps for the number of milliseconds named by the agent id.
  struct Sleepy;

  #[async_trait]
  impl AgentInvoker for Sleepy {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, CollaboratorError> {
      if request.agent_id == "fail" {
        return Err(CollaboratorError::permanent("branch agent failed"));
      }
      let ms: u64 = request.agent_id.parse().unwrap_or(0);
      tokio::time::sleep(Duration::from_millis(ms)).await;
      Ok(AgentResponse {
        output: json!({"slept": ms}),
        ..Default::default()
      })
    }
  }

  async fn run(node: Value, extra: Value) -> (RunScope, Result<NodeOutput, NodeExecutionError>, Vec<NodeResult>) {
    let mut nodes = vec![node];
    nodes.extend(extra.as_array().cloned().unwrap_or_default());
    let scope = testing::scope(
      json!({"id": "wf", "name": "par", "error_handling_strategy": "fail_fast", "nodes": nodes}),
      Collaborators {
        agents: Arc::new(Sleepy),
        ..Default::default()
      },
    );
    let context = ExecutionContext::default();
    let input = json!({"x": 1});
    let mut trace = Vec::new();
    let result = execute(
      &NodeCall {
        scope: &scope,
        node: scope.workflow.node("fan").unwrap(),
        context: &context,
        input: &input,
      },
      &mut trace,
    )
    .await;
    (scope, result, trace)
  }

  fn agents(ids: &[(&str, &str)]) -> Value {
    Value::Array(
      ids
        .iter()
        .map(|(id, agent)| json!({"id": id, "kind": "agent", "agent_id": agent}))
        .collect(),
    )
  }

  #[tokio::test]
  async fn test_wait_all_collects_every_branch() {
    let (_, result, trace) = run(
      json!({"id": "fan", "kind": "parallel", "branches": [
        {"id": "left", "nodes": ["l"]},
        {"id": "right", "nodes": ["r"]}
      ]}),
      agents(&[("l", "5"), ("r", "1")]),
    )
    .await;

    let out = result.unwrap();
    assert_eq!(out.output["branches"]["left"], json!({"slept": 5}));
    assert_eq!(out.output["completed"], json!(["left", "right"]));
    assert_eq!(out.owned_outputs.len(), 2);
    assert_eq!(trace.len(), 2);
  }

  #[tokio::test]
  async fn test_wait_first_n_cancels_slow_branch() {
    let (_, result, trace) = run(
      json!({"id": "fan", "kind": "parallel", "wait_strategy": "wait_first_n", "wait_count": 1,
        "branches": [
          {"id": "fast", "nodes": ["f"]},
          {"id": "slow", "nodes": ["s"]}
        ]}),
      agents(&[("f", "1"), ("s", "10000")]),
    )
    .await;

    let out = result.unwrap();
    assert_eq!(out.output["completed"], json!(["fast"]));
    assert_eq!(out.output["cancelled"], json!(["slow"]));
    assert!(out.owned_outputs.contains_key("f"));
    assert!(!out.owned_outputs.contains_key("s"));

    let slow = trace.iter().find(|r| r.node_id == "s").unwrap();
    assert_eq!(slow.status, NodeStatus::Skipped);
    assert_eq!(slow.scope, "fan/slow");
    assert_eq!(slow.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
  }

  #[tokio::test]
  async fn test_required_branch_failure_fails_wait_all() {
    let (_, result, _) = run(
      json!({"id": "fan", "kind": "parallel", "branches": [
        {"id": "ok", "nodes": ["a"]},
        {"id": "bad", "nodes": ["b"]}
      ]}),
      agents(&[("a", "1"), ("b", "fail")]),
    )
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Collaborator);
    assert!(err.message.contains("branch 'bad'"));
  }

  #[tokio::test]
  async fn test_optional_branch_failure_is_reported() {
    let (_, result, _) = run(
      json!({"id": "fan", "kind": "parallel", "branches": [
        {"id": "ok", "nodes": ["a"]},
        {"id": "bad", "nodes": ["b"], "required": false}
      ]}),
      agents(&[("a", "1"), ("b", "fail")]),
    )
    .await;

    let out = result.unwrap();
    assert_eq!(out.output["completed"], json!(["ok"]));
    assert_eq!(out.output["failed"], json!(["bad"]));
  }

  #[tokio::test]
  async fn test_wait_any_fails_when_every_branch_fails() {
    let (_, result, _) = run(
      json!({"id": "fan", "kind": "parallel", "wait_strategy": "wait_any", "branches": [
        {"id": "one", "nodes": ["a"]},
        {"id": "two", "nodes": ["b"]}
      ]}),
      agents(&[("a", "fail"), ("b", "fail")]),
    )
    .await;

    let err = result.unwrap_err();
    assert!(err.message.starts_with("only 0 of 1 required branches completed"));
  }

  #[tokio::test]
  async fn test_wait_timeout_deadline() {
    let (_, result, _) = run(
      json!({"id": "fan", "kind": "parallel", "wait_strategy": "wait_timeout", "deadline_ms": 50,
        "branches": [
          {"id": "quick", "nodes": ["q"]},
          {"id": "late", "nodes": ["l"], "required": false}
        ]}),
      agents(&[("q", "1"), ("l", "10000")]),
    )
    .await;

    let out = result.unwrap();
    assert_eq!(out.output["completed"], json!(["quick"]));
    assert_eq!(out.output["cancelled"], json!(["late"]));
  }
}
