//! Node executors, one module per node kind.
//!
//! An executor receives the node's resolved input and a read-only copy of
//! the context, and returns the node's output. Executors that run nested
//! scopes (loop, parallel, sub-workflow) append the attempts of the nodes
//! they ran to `trace` and hand those nodes' outputs back through
//! [`NodeOutput::owned_outputs`].

mod agent;
mod aggregator;
mod decision;
mod error_handler;
mod human;
mod loop_node;
mod parallel;
mod storage;
mod subworkflow;
mod transform;
mod trigger;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchyard_config::{NodeDef, NodeKind};

use crate::budget::ResourceUsage;
use crate::context::ExecutionContext;
use crate::engine::RunScope;
use crate::error::NodeExecutionError;
use crate::result::{NodeResult, Route};

/// Everything an executor may read.
pub(crate) struct NodeCall<'a> {
  pub scope: &'a RunScope,
  pub node: &'a NodeDef,
  pub context: &'a ExecutionContext,
  pub input: &'a Value,
}

impl NodeCall<'_> {
  /// Expression view of the context with `current` bound to the input.
  pub fn snapshot(&self) -> Value {
    self.context.snapshot_with_current(self.input)
  }
}

/// What a node produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct NodeOutput {
  pub output: Value,
  #[serde(skip)]
  pub usage: ResourceUsage,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub route: Option<Route>,
  /// Outputs of nested nodes run by this node.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub owned_outputs: BTreeMap<String, Value>,
}

impl NodeOutput {
  pub fn new(output: Value) -> Self {
    Self {
      output,
      ..Default::default()
    }
  }
}

/// Run one attempt of `call.node`.
pub(crate) async fn execute(
  call: &NodeCall<'_>,
  trace: &mut Vec<NodeResult>,
) -> Result<NodeOutput, NodeExecutionError> {
  match &call.node.kind {
    NodeKind::Agent { .. } => agent::execute(call).await,
    NodeKind::Decision { .. } => decision::execute(call),
    NodeKind::Transform { .. } => transform::execute(call),
    NodeKind::Loop { .. } => loop_node::execute(call, trace).await,
    NodeKind::Parallel { .. } => parallel::execute(call, trace).await,
    NodeKind::HumanInLoop { .. } => human::execute(call).await,
    NodeKind::Storage { .. } => storage::execute(call).await,
    NodeKind::ErrorHandler { .. } => error_handler::execute(call),
    NodeKind::Aggregator { .. } => aggregator::execute(call),
    NodeKind::ExternalTrigger { .. } => trigger::execute(call).await,
    NodeKind::SubWorkflow { .. } => subworkflow::execute(call, trace).await,
  }
}

/// Whether a node kind only drives other nodes of the run.
pub(crate) fn is_container(kind: &NodeKind) -> bool {
  matches!(
    kind,
    NodeKind::Loop { .. } | NodeKind::Parallel { .. } | NodeKind::SubWorkflow { .. }
  )
}

/// Whether a node kind always finishes on its own and gets the default timeout.
pub(crate) fn is_bounded(kind: &NodeKind) -> bool {
  matches!(
    kind,
    NodeKind::Agent { .. }
      | NodeKind::Decision { .. }
      | NodeKind::Transform { .. }
      | NodeKind::Storage { .. }
      | NodeKind::ErrorHandler { .. }
      | NodeKind::Aggregator { .. }
  )
}
