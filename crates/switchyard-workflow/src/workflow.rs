use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};
use switchyard_config::{NodeDef, NodeKind, WorkflowDef, WorkflowSettings};

use crate::error::WorkflowError;
use crate::graph::Graph;

/// A validated workflow, ready for execution.
///
/// Nodes owned by a loop body or parallel branch are only run by their
/// container; error handlers and fallback nodes are only run by the error
/// policy. Everything else is dispatched by the top-level scheduler.
#[derive(Debug, Clone)]
pub struct Workflow {
  def: WorkflowDef,
  positions: HashMap<String, usize>,
  graph: Graph,
  /// owned node_id -> scope key of its container (`loop_id` or `par_id/branch_id`)
  owners: HashMap<String, String>,
  handlers: HashSet<String>,
  fingerprint: String,
}

impl Workflow {
  /// Validate a definition and lock it.
  pub fn from_def(def: WorkflowDef) -> Result<Self, WorkflowError> {
    let mut positions = HashMap::new();
    for (idx, node) in def.nodes.iter().enumerate() {
      if positions.insert(node.id.clone(), idx).is_some() {
        return Err(WorkflowError::DuplicateNode(node.id.clone()));
      }
    }

    for edge in &def.edges {
      if !positions.contains_key(&edge.source_id) || !positions.contains_key(&edge.target_id) {
        return Err(WorkflowError::InvalidEdge {
          from: edge.source_id.clone(),
          to: edge.target_id.clone(),
        });
      }
    }

    detect_unconditioned_cycle(&def)?;

    let owners = resolve_owners(&def, &positions)?;
    let handlers = resolve_handlers(&def, &positions, &owners)?;
    let graph = Graph::new(&def.nodes, &def.edges);

    let scope_of = |id: &str| -> String {
      if handlers.contains(id) {
        format!("handler:{id}")
      } else {
        owners.get(id).cloned().unwrap_or_default()
      }
    };
    for edge in &def.edges {
      if scope_of(&edge.source_id) != scope_of(&edge.target_id) {
        return Err(WorkflowError::InvalidNodeConfig {
          node_id: edge.target_id.clone(),
          message: format!(
            "edge from '{}' crosses a loop, branch or handler boundary",
            edge.source_id
          ),
        });
      }
    }

    for node in &def.nodes {
      validate_node_refs(node, &positions, &graph)?;
    }

    let top_entries = graph
      .entry_points()
      .iter()
      .filter(|id| !owners.contains_key(*id) && !handlers.contains(*id))
      .count();
    if top_entries == 0 {
      return Err(WorkflowError::NoEntryPoints);
    }

    for node in &def.nodes {
      if !handlers.contains(&node.id) && !graph.is_reachable(&node.id) {
        return Err(WorkflowError::UnreachableNode(node.id.clone()));
      }
    }

    let canonical = serde_json::to_vec(&def).map_err(|e| WorkflowError::InvalidNodeConfig {
      node_id: def.id.clone(),
      message: format!("definition is not serializable: {e}"),
    })?;
    let fingerprint = format!("sha256:{:x}", Sha256::digest(&canonical));

    Ok(Self {
      def,
      positions,
      graph,
      owners,
      handlers,
      fingerprint,
    })
  }

  pub fn id(&self) -> &str {
    &self.def.id
  }

  pub fn def(&self) -> &WorkflowDef {
    &self.def
  }

  pub fn settings(&self) -> &WorkflowSettings {
    &self.def.settings
  }

  /// Nodes in declaration order.
  pub fn nodes(&self) -> &[NodeDef] {
    &self.def.nodes
  }

  pub fn node(&self, node_id: &str) -> Option<&NodeDef> {
    self.positions.get(node_id).map(|idx| &self.def.nodes[*idx])
  }

  pub fn graph(&self) -> &Graph {
    &self.graph
  }

  /// Content digest of the definition this workflow was built from.
  pub fn fingerprint(&self) -> &str {
    &self.fingerprint
  }

  /// Ids of the nodes dispatched by the top-level scheduler.
  pub fn top_level(&self) -> HashSet<String> {
    self
      .def
      .nodes
      .iter()
      .filter(|n| !self.owners.contains_key(&n.id) && !self.handlers.contains(&n.id))
      .map(|n| n.id.clone())
      .collect()
  }

  /// Nodes of a scope with no outgoing edges, in declaration order.
  pub fn sinks(&self, scope: &HashSet<String>) -> Vec<&str> {
    self
      .def
      .nodes
      .iter()
      .filter(|n| scope.contains(&n.id) && self.graph.outgoing(&n.id).is_empty())
      .map(|n| n.id.as_str())
      .collect()
  }
}

/// Reject cycles formed purely by unconditioned edges.
fn detect_unconditioned_cycle(def: &WorkflowDef) -> Result<(), WorkflowError> {
  let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
  for node in &def.nodes {
    adjacency.insert(node.id.as_str(), Vec::new());
  }
  for edge in def.edges.iter().filter(|e| e.condition.is_none()) {
    if let Some(neighbors) = adjacency.get_mut(edge.source_id.as_str()) {
      neighbors.push(edge.target_id.as_str());
    }
  }

  // DFS with coloring: 0 = white (unvisited), 1 = gray (in progress), 2 = black (done)
  let mut color: HashMap<&str, u8> = def.nodes.iter().map(|n| (n.id.as_str(), 0u8)).collect();

  fn dfs<'a>(
    node: &'a str,
    adjacency: &HashMap<&str, Vec<&'a str>>,
    color: &mut HashMap<&'a str, u8>,
  ) -> Option<&'a str> {
    color.insert(node, 1);

    if let Some(neighbors) = adjacency.get(node) {
      for &neighbor in neighbors {
        match color.get(neighbor) {
          Some(1) => return Some(neighbor),
          Some(0) => {
            if let Some(found) = dfs(neighbor, adjacency, color) {
              return Some(found);
            }
          }
          _ => {}
        }
      }
    }

    color.insert(node, 2);
    None
  }

  for node in &def.nodes {
    if color.get(node.id.as_str()) == Some(&0) {
      if let Some(found) = dfs(node.id.as_str(), &adjacency, &mut color) {
        return Err(WorkflowError::CycleDetected {
          node_id: found.to_string(),
        });
      }
    }
  }

  Ok(())
}

/// Map every loop-body and branch node to the scope of its container.
fn resolve_owners(
  def: &WorkflowDef,
  positions: &HashMap<String, usize>,
) -> Result<HashMap<String, String>, WorkflowError> {
  let mut owners: HashMap<String, String> = HashMap::new();
  let mut container_of: HashMap<String, String> = HashMap::new();

  let mut claim = |container: &str, scope: String, ids: &[String]| -> Result<(), WorkflowError> {
    if ids.is_empty() {
      return Err(WorkflowError::InvalidNodeConfig {
        node_id: container.to_string(),
        message: "container owns no nodes".to_string(),
      });
    }
    for id in ids {
      if !positions.contains_key(id) || id == container {
        return Err(WorkflowError::InvalidNodeConfig {
          node_id: container.to_string(),
          message: format!("cannot own node '{id}'"),
        });
      }
      if owners.insert(id.clone(), scope.clone()).is_some() {
        return Err(WorkflowError::InvalidNodeConfig {
          node_id: container.to_string(),
          message: format!("node '{id}' is already owned by another container"),
        });
      }
      container_of.insert(id.clone(), container.to_string());
    }
    Ok(())
  };

  for node in &def.nodes {
    match &node.kind {
      NodeKind::Loop { body, .. } => claim(&node.id, node.id.clone(), body)?,
      NodeKind::Parallel { branches, .. } => {
        if branches.is_empty() {
          return Err(WorkflowError::InvalidNodeConfig {
            node_id: node.id.clone(),
            message: "parallel node declares no branches".to_string(),
          });
        }
        for branch in branches {
          claim(&node.id, format!("{}/{}", node.id, branch.id), &branch.nodes)?;
        }
      }
      _ => {}
    }
  }

  // A container must not (transitively) own itself.
  for start in container_of.keys() {
    let mut current = start.as_str();
    let mut steps = 0;
    while let Some(parent) = container_of.get(current) {
      if parent == start || steps > positions.len() {
        return Err(WorkflowError::InvalidNodeConfig {
          node_id: start.clone(),
          message: "containers own each other".to_string(),
        });
      }
      current = parent;
      steps += 1;
    }
  }

  Ok(owners)
}

/// Collect nodes that only run on behalf of a failed node.
fn resolve_handlers(
  def: &WorkflowDef,
  positions: &HashMap<String, usize>,
  owners: &HashMap<String, String>,
) -> Result<HashSet<String>, WorkflowError> {
  let mut handlers = HashSet::new();
  let mut referenced: Vec<(&str, &str)> = Vec::new();

  for node in &def.nodes {
    if let NodeKind::ErrorHandler {
      fallback_target, ..
    } = &node.kind
    {
      handlers.insert(node.id.clone());
      if let Some(target) = fallback_target {
        referenced.push((node.id.as_str(), target.as_str()));
      }
    }
    if let Some(fallback) = &node.fallback_node {
      referenced.push((node.id.as_str(), fallback.as_str()));
    }
  }
  if let Some(global) = &def.global_error_handler {
    referenced.push((def.id.as_str(), global.as_str()));
  }

  for (from, target) in referenced {
    if !positions.contains_key(target) || from == target {
      return Err(WorkflowError::InvalidNodeConfig {
        node_id: from.to_string(),
        message: format!("fallback target '{target}' does not exist"),
      });
    }
    handlers.insert(target.to_string());
  }

  for id in &handlers {
    if owners.contains_key(id) {
      return Err(WorkflowError::InvalidNodeConfig {
        node_id: id.clone(),
        message: "an error handler cannot be owned by a loop or parallel branch".to_string(),
      });
    }
  }

  Ok(handlers)
}

fn validate_node_refs(
  node: &NodeDef,
  positions: &HashMap<String, usize>,
  graph: &Graph,
) -> Result<(), WorkflowError> {
  let invalid = |message: String| WorkflowError::InvalidNodeConfig {
    node_id: node.id.clone(),
    message,
  };

  match &node.kind {
    NodeKind::Decision {
      branches,
      default_target,
    } => {
      let targets = branches
        .iter()
        .map(|b| &b.target)
        .chain(default_target.iter());
      for target in targets {
        if !graph.has_edge(&node.id, target) {
          return Err(invalid(format!(
            "branch target '{target}' is not a downstream node"
          )));
        }
      }
    }
    NodeKind::HumanInLoop {
      rejected_target: Some(target),
      ..
    } => {
      if !graph.has_edge(&node.id, target) {
        return Err(invalid(format!(
          "rejected target '{target}' is not a downstream node"
        )));
      }
    }
    NodeKind::Aggregator { sources, .. } => {
      if let Some(missing) = sources.iter().find(|s| !positions.contains_key(*s)) {
        return Err(invalid(format!("aggregator source '{missing}' does not exist")));
      }
    }
    NodeKind::ExternalTrigger { .. } => {
      if graph.has_incoming(&node.id) {
        return Err(invalid(
          "external trigger nodes cannot have upstream nodes".to_string(),
        ));
      }
    }
    NodeKind::Loop {
      loop_type,
      source,
      condition,
      count,
      ..
    } => {
      use switchyard_config::LoopKind;
      let ok = match loop_type {
        LoopKind::ForEach => source.is_some(),
        LoopKind::While | LoopKind::Until => condition.is_some(),
        LoopKind::FixedCount => count.is_some(),
      };
      if !ok {
        return Err(invalid(format!(
          "{loop_type:?} loop is missing its source, condition or count"
        )));
      }
    }
    _ => {}
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn parse(value: serde_json::Value) -> Result<Workflow, WorkflowError> {
    let def: WorkflowDef = serde_json::from_value(value).unwrap();
    Workflow::from_def(def)
  }

  fn agent(id: &str) -> serde_json::Value {
    json!({ "id": id, "kind": "agent", "agent_id": "a" })
  }

  fn edge(from: &str, to: &str) -> serde_json::Value {
    json!({ "source_id": from, "target_id": to })
  }

  #[test]
  fn test_linear_workflow_is_valid() {
    let wf = parse(json!({
      "id": "wf", "name": "Linear",
      "nodes": [agent("a"), agent("b")],
      "edges": [edge("a", "b")]
    }))
    .unwrap();

    assert_eq!(wf.top_level().len(), 2);
    assert_eq!(wf.node("b").map(|n| n.id.as_str()), Some("b"));
    assert!(wf.fingerprint().starts_with("sha256:"));
  }

  #[test]
  fn test_duplicate_node_is_rejected() {
    let err = parse(json!({
      "id": "wf", "name": "Dup",
      "nodes": [agent("a"), agent("a")]
    }))
    .unwrap_err();
    assert!(matches!(err, WorkflowError::DuplicateNode(id) if id == "a"));
  }

  #[test]
  fn test_dangling_edge_is_rejected() {
    let err = parse(json!({
      "id": "wf", "name": "Dangling",
      "nodes": [agent("a")],
      "edges": [edge("a", "ghost")]
    }))
    .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidEdge { to, .. } if to == "ghost"));
  }

  #[test]
  fn test_unconditioned_cycle_is_rejected() {
    let err = parse(json!({
      "id": "wf", "name": "Cycle",
      "nodes": [agent("s"), agent("a"), agent("b")],
      "edges": [edge("s", "a"), edge("a", "b"), edge("b", "a")]
    }))
    .unwrap_err();
    assert!(matches!(err, WorkflowError::CycleDetected { .. }));
  }

  #[test]
  fn test_conditioned_cycle_is_accepted() {
    let wf = parse(json!({
      "id": "wf", "name": "Retry loop",
      "nodes": [agent("s"), agent("a"), agent("b")],
      "edges": [
        edge("s", "a"),
        edge("a", "b"),
        { "source_id": "b", "target_id": "a", "condition": "nodes.b.output.again" }
      ]
    }))
    .unwrap();
    assert_eq!(wf.graph().upstream("a"), vec!["s"]);
  }

  #[test]
  fn test_unreachable_cycle_is_rejected() {
    let err = parse(json!({
      "id": "wf", "name": "Island",
      "nodes": [agent("s"), agent("x"), agent("y")],
      "edges": [
        { "source_id": "x", "target_id": "y", "condition": "true" },
        { "source_id": "y", "target_id": "x", "condition": "true" }
      ]
    }))
    .unwrap_err();
    assert!(matches!(err, WorkflowError::UnreachableNode(_)));
  }

  #[test]
  fn test_owned_nodes_leave_top_level() {
    let wf = parse(json!({
      "id": "wf", "name": "Loop",
      "nodes": [
        { "id": "each", "kind": "loop", "loop_type": "fixed_count", "count": 2, "body": ["step"] },
        agent("step"),
        { "id": "oops", "kind": "error_handler" },
        agent("after")
      ],
      "edges": [edge("each", "after")]
    }))
    .unwrap();

    let top = wf.top_level();
    assert!(top.contains("each"));
    assert!(top.contains("after"));
    assert!(!top.contains("step"));
    assert!(!top.contains("oops"));
  }

  #[test]
  fn test_edge_into_loop_body_is_rejected() {
    let err = parse(json!({
      "id": "wf", "name": "Leaky",
      "nodes": [
        agent("s"),
        { "id": "each", "kind": "loop", "loop_type": "fixed_count", "count": 2, "body": ["step"] },
        agent("step")
      ],
      "edges": [edge("s", "each"), edge("s", "step")]
    }))
    .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidNodeConfig { node_id, .. } if node_id == "step"));
  }

  #[test]
  fn test_decision_target_must_be_downstream() {
    let err = parse(json!({
      "id": "wf", "name": "Decide",
      "nodes": [
        { "id": "d", "kind": "decision", "branches": [{ "expression": "true", "target": "x" }] },
        agent("x"),
        agent("y")
      ],
      "edges": [edge("d", "y"), edge("y", "x")]
    }))
    .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidNodeConfig { node_id, .. } if node_id == "d"));
  }

  #[test]
  fn test_trigger_with_upstream_is_rejected() {
    let err = parse(json!({
      "id": "wf", "name": "Trigger",
      "nodes": [agent("a"), { "id": "t", "kind": "external_trigger", "event_name": "go" }],
      "edges": [edge("a", "t")]
    }))
    .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidNodeConfig { node_id, .. } if node_id == "t"));
  }

  #[test]
  fn test_missing_fallback_target_is_rejected() {
    let err = parse(json!({
      "id": "wf", "name": "Fallback",
      "nodes": [{ "id": "a", "kind": "agent", "agent_id": "x", "fallback_node": "nope" }]
    }))
    .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidNodeConfig { .. }));
  }
}
