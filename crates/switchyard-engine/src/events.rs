//! Execution events and notifiers for observability.
//!
//! Events are emitted during workflow execution to allow consumers to observe
//! progress, persist state, stream to UIs, etc.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
  /// Workflow execution has started (or resumed).
  WorkflowStarted {
    execution_id: String,
    workflow_id: String,
  },

  /// A node attempt has started.
  NodeStarted {
    execution_id: String,
    node_id: String,
    attempt: u32,
  },

  /// A node has completed successfully.
  NodeCompleted {
    execution_id: String,
    node_id: String,
    output: serde_json::Value,
  },

  /// A node attempt has failed.
  NodeFailed {
    execution_id: String,
    node_id: String,
    error: String,
  },

  /// A node was skipped, either untraversed or by the error policy.
  NodeSkipped {
    execution_id: String,
    node_id: String,
  },

  /// A failed node will be attempted again.
  NodeRetrying {
    execution_id: String,
    node_id: String,
    attempt: u32,
    delay_ms: u64,
  },

  /// Spending crossed the configured warning fraction of the cost ceiling.
  BudgetWarning {
    execution_id: String,
    cost_usd: f64,
    max_cost_usd: f64,
  },

  CheckpointSaved {
    execution_id: String,
    checkpoint_id: String,
    sequence: u64,
  },

  /// Workflow execution has completed successfully.
  WorkflowCompleted { execution_id: String },

  /// Workflow execution has failed.
  WorkflowFailed { execution_id: String, error: String },

  WorkflowCancelled { execution_id: String },
}

/// Trait for receiving execution events.
///
/// Implement this trait to receive events during workflow execution.
/// The engine calls `notify` for each event - implementations decide
/// what to do with them (persist, broadcast, log, ignore, etc.).
pub trait ExecutionNotifier: Send + Sync {
  /// Called when an execution event occurs.
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
///
/// Use this when you need to consume events asynchronously (e.g., persist
/// to a database, stream to a UI, etc.).
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls a node. Volume is a handful of
  // events per node attempt.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
