//! Checkpoint capture and compatibility checks.
//!
//! A checkpoint is the run's resumable state: context, scheduler node states
//! and routes, the trace so far and budget counters. Resuming rebuilds the
//! scheduler from it and replays readiness, so completed nodes never run
//! again and nodes that were in flight start over.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchyard_config::WorkflowSettings;
use switchyard_store::{CheckpointError, CheckpointStore};
use switchyard_workflow::Workflow;

use crate::budget::BudgetUsage;
use crate::context::ExecutionContext;
use crate::result::NodeResult;
use crate::scheduler::{NodeState, SchedulerState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
  pub checkpoint_id: String,
  pub execution_id: String,
  pub workflow_id: String,
  /// Fingerprint of the definition the run was started with.
  pub fingerprint: String,
  pub sequence: u64,
  pub created_at: DateTime<Utc>,
  pub started_at: DateTime<Utc>,
  /// Settings in force for the run, overrides included.
  pub settings: WorkflowSettings,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_override_ms: Option<u64>,
  pub context: ExecutionContext,
  pub scheduler: SchedulerState,
  pub completed: Vec<String>,
  pub pending: Vec<String>,
  /// Nodes that were running when the checkpoint was taken.
  pub ready: Vec<String>,
  pub node_results: Vec<NodeResult>,
  pub usage: BudgetUsage,
}

impl Checkpoint {
  /// Capture run state. Id, sequence and creation time are assigned on save.
  #[allow(clippy::too_many_arguments)]
  pub fn capture(
    execution_id: &str,
    workflow: &Workflow,
    started_at: DateTime<Utc>,
    settings: &WorkflowSettings,
    context: &ExecutionContext,
    scheduler: &SchedulerState,
    node_results: &[NodeResult],
    usage: BudgetUsage,
  ) -> Self {
    let in_state = |state: NodeState| -> Vec<String> {
      workflow
        .nodes()
        .iter()
        .filter(|n| scheduler.states.get(&n.id) == Some(&state))
        .map(|n| n.id.clone())
        .collect()
    };

    Self {
      checkpoint_id: String::new(),
      execution_id: execution_id.to_string(),
      workflow_id: workflow.id().to_string(),
      fingerprint: workflow.fingerprint().to_string(),
      sequence: 0,
      created_at: Utc::now(),
      started_at,
      settings: settings.clone(),
      timeout_override_ms: None,
      context: context.clone(),
      scheduler: scheduler.clone(),
      completed: in_state(NodeState::Completed),
      pending: in_state(NodeState::Pending),
      ready: in_state(NodeState::Running),
      node_results: node_results.to_vec(),
      usage,
    }
  }
}

/// Decides when to checkpoint and writes snapshots to the store.
pub struct CheckpointManager {
  store: Arc<dyn CheckpointStore>,
  enabled: bool,
  interval: Option<Duration>,
  last_saved: Option<Instant>,
  sequence: u64,
}

impl CheckpointManager {
  pub fn new(store: Arc<dyn CheckpointStore>, settings: &WorkflowSettings) -> Self {
    Self {
      store,
      enabled: settings.enable_checkpoints,
      interval: settings.checkpoint_interval_ms.map(Duration::from_millis),
      last_saved: None,
      sequence: 0,
    }
  }

  /// Continue numbering after a resumed checkpoint.
  pub fn with_sequence(mut self, sequence: u64) -> Self {
    self.sequence = sequence;
    self
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled
  }

  /// Whether a checkpoint should be written after the current completion.
  pub fn due(&self) -> bool {
    if !self.enabled {
      return false;
    }
    match (self.interval, self.last_saved) {
      (Some(interval), Some(last)) => last.elapsed() >= interval,
      _ => true,
    }
  }

  /// Assign an id and sequence, then persist.
  pub async fn save(&mut self, mut checkpoint: Checkpoint) -> Result<Checkpoint, CheckpointError> {
    self.sequence += 1;
    checkpoint.sequence = self.sequence;
    checkpoint.checkpoint_id = uuid::Uuid::new_v4().to_string();
    checkpoint.created_at = Utc::now();

    let encoded = serde_json::to_value(&checkpoint)
      .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
    self
      .store
      .save(&checkpoint.execution_id, &encoded)
      .await?;
    self.last_saved = Some(Instant::now());
    Ok(checkpoint)
  }
}

/// Load the latest checkpoint of an execution and check it against
/// `workflow`.
///
/// When `checkpoint_id` is given it must name the latest checkpoint.
pub async fn load(
  store: &dyn CheckpointStore,
  execution_id: &str,
  checkpoint_id: Option<&str>,
  workflow: &Workflow,
) -> Result<Checkpoint, CheckpointError> {
  let raw = store
    .load(execution_id)
    .await?
    .ok_or_else(|| CheckpointError::NotFound(execution_id.to_string()))?;

  let checkpoint: Checkpoint =
    serde_json::from_value(raw).map_err(|e| CheckpointError::Corrupted(e.to_string()))?;

  if let Some(wanted) = checkpoint_id {
    if checkpoint.checkpoint_id != wanted {
      return Err(CheckpointError::NotFound(format!(
        "{wanted} (latest checkpoint of {execution_id} is {})",
        checkpoint.checkpoint_id
      )));
    }
  }
  if checkpoint.execution_id != execution_id {
    return Err(CheckpointError::Corrupted(format!(
      "snapshot stored for '{execution_id}' belongs to '{}'",
      checkpoint.execution_id
    )));
  }

  let incompatible = |message: String| CheckpointError::Incompatible {
    execution_id: execution_id.to_string(),
    message,
  };
  if checkpoint.workflow_id != workflow.id() {
    return Err(incompatible(format!(
      "taken for workflow '{}', not '{}'",
      checkpoint.workflow_id,
      workflow.id()
    )));
  }
  if checkpoint.fingerprint != workflow.fingerprint() {
    return Err(incompatible(
      "workflow definition changed since the checkpoint was taken".to_string(),
    ));
  }
  let unknown = checkpoint
    .scheduler
    .states
    .keys()
    .chain(checkpoint.context.node_outputs.keys())
    .find(|id| workflow.node(id).is_none());
  if let Some(id) = unknown {
    return Err(incompatible(format!("unknown node '{id}'")));
  }

  Ok(checkpoint)
}
