//! Readiness tracking for one execution scope.
//!
//! The scheduler owns the state of every node in a scope (the top-level
//! graph, one loop iteration, one parallel branch or a sub-workflow). It is
//! a plain state machine: the coordinator marks transitions and calls
//! [`Scheduler::scan`] after each committed result to learn which nodes can
//! start. Because the state serializes, a resumed run rebuilds the scheduler
//! and replays readiness over the persisted node states.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchyard_workflow::Workflow;
use tracing::warn;

use crate::expr;
use crate::result::Route;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
  Pending,
  Running,
  Completed,
  Failed,
  Skipped,
}

impl NodeState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      NodeState::Completed | NodeState::Failed | NodeState::Skipped
    )
  }
}

/// Serializable scheduler state, stored in checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
  pub states: BTreeMap<String, NodeState>,
  /// Routing chosen by completed decision and approval nodes.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub routes: BTreeMap<String, Route>,
}

/// A node eligible to start, with the incoming edges that were traversed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyNode {
  pub node_id: String,
  /// Indices of satisfied incoming edges; empty for entry nodes.
  pub edges: Vec<usize>,
}

/// Result of a readiness scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scan {
  /// Nodes that may start, in declaration order.
  pub ready: Vec<ReadyNode>,
  /// Nodes newly marked skipped by this scan.
  pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
  /// Scope members in declaration order.
  members: Vec<String>,
  state: SchedulerState,
}

impl Scheduler {
  pub fn new(workflow: &Workflow, members: &HashSet<String>) -> Self {
    Self::from_state(workflow, members, SchedulerState::default())
  }

  /// Rebuild a scheduler from persisted state.
  ///
  /// Nodes that were running or had failed when the state was captured go
  /// back to pending so they run again.
  pub fn from_state(
    workflow: &Workflow,
    members: &HashSet<String>,
    mut state: SchedulerState,
  ) -> Self {
    let members: Vec<String> = workflow
      .nodes()
      .iter()
      .filter(|n| members.contains(&n.id))
      .map(|n| n.id.clone())
      .collect();

    state.states.retain(|id, _| members.contains(id));
    for id in &members {
      let entry = state.states.entry(id.clone()).or_insert(NodeState::Pending);
      if matches!(entry, NodeState::Running | NodeState::Failed) {
        *entry = NodeState::Pending;
      }
    }
    state
      .routes
      .retain(|id, _| state.states.get(id) == Some(&NodeState::Completed));

    Self { members, state }
  }

  pub fn state(&self) -> &SchedulerState {
    &self.state
  }

  pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
    self.state.states.get(node_id).copied()
  }

  fn set(&mut self, node_id: &str, state: NodeState) {
    if let Some(entry) = self.state.states.get_mut(node_id) {
      *entry = state;
    }
  }

  pub fn mark_running(&mut self, node_id: &str) {
    self.set(node_id, NodeState::Running);
  }

  pub fn mark_completed(&mut self, node_id: &str, route: Option<Route>) {
    self.set(node_id, NodeState::Completed);
    if let Some(route) = route {
      self.state.routes.insert(node_id.to_string(), route);
    }
  }

  pub fn mark_failed(&mut self, node_id: &str) {
    self.set(node_id, NodeState::Failed);
  }

  pub fn mark_skipped(&mut self, node_id: &str) {
    self.set(node_id, NodeState::Skipped);
  }

  /// Every member has reached a terminal state.
  pub fn is_finished(&self) -> bool {
    self.state.states.values().all(NodeState::is_terminal)
  }

  /// Members in `state`, in declaration order.
  pub fn nodes_in(&self, state: NodeState) -> Vec<String> {
    self
      .members
      .iter()
      .filter(|id| self.node_state(id) == Some(state))
      .cloned()
      .collect()
  }

  /// Skip-propagate to a fixpoint, then collect the ready nodes.
  ///
  /// A pending node is ready when it has no forward incoming edges, or
  /// when all of its sources are terminal and at least one incoming edge
  /// was traversed. An edge is traversed when its source completed, the
  /// source's route allows the target and the edge condition holds. Edges
  /// leaving a node that chose an exclusive route ignore their conditions.
  /// A node whose sources are all terminal with no traversed edge is
  /// skipped.
  pub fn scan(&mut self, workflow: &Workflow, snapshot: &Value) -> Scan {
    let mut scan = Scan::default();

    loop {
      let mut changed = false;
      for idx in 0..self.members.len() {
        let id = self.members[idx].clone();
        if self.node_state(&id) != Some(NodeState::Pending) {
          continue;
        }
        if let Readiness::Unsatisfied = self.readiness(workflow, &id, snapshot) {
          self.mark_skipped(&id);
          scan.skipped.push(id);
          changed = true;
        }
      }
      if !changed {
        break;
      }
    }

    for id in &self.members {
      if self.node_state(id) != Some(NodeState::Pending) {
        continue;
      }
      if let Readiness::Ready(edges) = self.readiness(workflow, id, snapshot) {
        scan.ready.push(ReadyNode {
          node_id: id.clone(),
          edges,
        });
      }
    }

    scan
  }

  fn readiness(&self, workflow: &Workflow, node_id: &str, snapshot: &Value) -> Readiness {
    let graph = workflow.graph();
    let incoming = graph.forward_incoming(node_id);
    if incoming.is_empty() {
      return Readiness::Ready(Vec::new());
    }

    let mut satisfied = Vec::new();
    for idx in incoming {
      let edge = graph.edge(idx);
      let Some(source_state) = self.node_state(&edge.source_id) else {
        continue;
      };
      if !source_state.is_terminal() {
        return Readiness::Waiting;
      }
      if source_state != NodeState::Completed {
        continue;
      }

      let route = self.state.routes.get(&edge.source_id);
      if route.is_some_and(|r| !r.allows(node_id)) {
        continue;
      }
      let exclusive = matches!(route, Some(Route::Only { .. }));
      let condition_holds = match (&edge.condition, exclusive) {
        (Some(condition), false) => match expr::evaluate_condition(snapshot, condition) {
          Ok(holds) => holds,
          Err(e) => {
            warn!(
              source_id = %edge.source_id,
              target_id = %edge.target_id,
              error = %e,
              "edge condition failed to evaluate, treating as false"
            );
            false
          }
        },
        _ => true,
      };
      if condition_holds {
        satisfied.push(idx);
      }
    }

    if satisfied.is_empty() {
      Readiness::Unsatisfied
    } else {
      Readiness::Ready(satisfied)
    }
  }
}

enum Readiness {
  Ready(Vec<usize>),
  Waiting,
  Unsatisfied,
}
