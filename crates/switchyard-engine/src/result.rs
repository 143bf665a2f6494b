//! Node results and the terminal execution record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::{BudgetUsage, ResourceUsage};
use crate::error::NodeExecutionError;

/// Routing decided by a node for its outgoing edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Route {
  /// Only the edge(s) to `target` are traversed.
  Only { target: String },
  /// Every edge except the one(s) to `target` is traversed.
  Exclude { target: String },
}

impl Route {
  pub fn allows(&self, target_id: &str) -> bool {
    match self {
      Route::Only { target } => target == target_id,
      Route::Exclude { target } => target != target_id,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
  Success,
  Failure,
  Skipped,
}

/// One node execution attempt, as retained in the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
  /// Unique id of this attempt.
  pub task_id: String,
  pub node_id: String,
  /// Nesting path of the scope that ran the node, empty at top level.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub scope: String,
  pub attempt: u32,
  pub status: NodeStatus,
  pub input: serde_json::Value,
  pub output: serde_json::Value,
  #[serde(default)]
  pub usage: ResourceUsage,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub route: Option<Route>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<NodeExecutionError>,
  /// Handler whose output stood in for this node after a failure.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub recovered_by: Option<String>,
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
}

impl NodeResult {
  /// A node that never ran because no incoming edge was traversed.
  pub fn skipped(node_id: &str, scope: &str, reason: Option<NodeExecutionError>) -> Self {
    let now = Utc::now();
    Self {
      task_id: uuid::Uuid::new_v4().to_string(),
      node_id: node_id.to_string(),
      scope: scope.to_string(),
      attempt: 0,
      status: NodeStatus::Skipped,
      input: serde_json::Value::Null,
      output: serde_json::Value::Null,
      usage: ResourceUsage::default(),
      route: None,
      error: reason,
      recovered_by: None,
      started_at: now,
      finished_at: now,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
  Running,
  Completed,
  Failed,
  Cancelled,
}

impl ExecutionStatus {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, ExecutionStatus::Running)
  }
}

/// The run-level failure reported in a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub node_id: Option<String>,
  #[serde(flatten)]
  pub error: NodeExecutionError,
}

/// The artifact of one run, finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
  pub execution_id: String,
  pub workflow_id: String,
  pub status: ExecutionStatus,
  #[serde(default)]
  pub output: serde_json::Value,
  /// Every attempt in completion order.
  pub node_results: Vec<NodeResult>,
  pub usage: BudgetUsage,
  pub started_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<ExecutionFailure>,
  /// Checkpoint this run was resumed from.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resumed_from: Option<String>,
}

impl ExecutionRecord {
  pub fn new(execution_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
    Self {
      execution_id: execution_id.into(),
      workflow_id: workflow_id.into(),
      status: ExecutionStatus::Running,
      output: serde_json::Value::Null,
      node_results: Vec::new(),
      usage: BudgetUsage::default(),
      started_at: Utc::now(),
      finished_at: None,
      error: None,
      resumed_from: None,
    }
  }

  /// Move to a terminal status. Returns false if already finalized.
  pub fn finalize(
    &mut self,
    status: ExecutionStatus,
    output: serde_json::Value,
    error: Option<ExecutionFailure>,
    usage: BudgetUsage,
  ) -> bool {
    if self.status.is_terminal() {
      return false;
    }
    self.status = status;
    self.output = output;
    self.error = error;
    self.usage = usage;
    self.finished_at = Some(Utc::now());
    true
  }

  /// The final attempt recorded for a node, if any.
  pub fn last_result(&self, node_id: &str) -> Option<&NodeResult> {
    self.node_results.iter().rev().find(|r| r.node_id == node_id)
  }

  /// Number of attempts that actually ran for a node.
  pub fn attempts(&self, node_id: &str) -> usize {
    self
      .node_results
      .iter()
      .filter(|r| r.node_id == node_id && r.status != NodeStatus::Skipped)
      .count()
  }
}
