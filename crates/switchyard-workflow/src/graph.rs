use std::collections::{HashMap, HashSet};

use switchyard_config::{EdgeDef, NodeDef};

/// Graph structure for traversal and analysis.
///
/// Edges are addressed by their index in the definition. An edge that closes
/// a cycle (only possible through a conditioned edge) is a back edge and is
/// ignored when deciding whether a node is ready.
#[derive(Debug, Clone)]
pub struct Graph {
  edges: Vec<EdgeDef>,
  /// node_id -> indices of outgoing edges, in declaration order.
  outgoing: HashMap<String, Vec<usize>>,
  /// node_id -> indices of incoming edges, in declaration order.
  incoming: HashMap<String, Vec<usize>>,
  /// Nodes with no incoming edges, in declaration order.
  entry_points: Vec<String>,
  back_edges: HashSet<usize>,
  reachable: HashSet<String>,
}

impl Graph {
  /// Build a graph from nodes and edges.
  ///
  /// Edges referencing unknown nodes must already have been rejected.
  pub fn new(nodes: &[NodeDef], edges: &[EdgeDef]) -> Self {
    let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
    let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();

    for node in nodes {
      outgoing.entry(node.id.clone()).or_default();
      incoming.entry(node.id.clone()).or_default();
    }

    for (idx, edge) in edges.iter().enumerate() {
      outgoing.entry(edge.source_id.clone()).or_default().push(idx);
      incoming.entry(edge.target_id.clone()).or_default().push(idx);
    }

    let entry_points: Vec<String> = nodes
      .iter()
      .filter(|n| incoming.get(&n.id).is_none_or(|v| v.is_empty()))
      .map(|n| n.id.clone())
      .collect();

    let mut graph = Self {
      edges: edges.to_vec(),
      outgoing,
      incoming,
      entry_points,
      back_edges: HashSet::new(),
      reachable: HashSet::new(),
    };
    graph.classify_edges();
    graph
  }

  /// DFS from every entry point, recording back edges and visited nodes.
  fn classify_edges(&mut self) {
    // 0 = unvisited, 1 = on the stack, 2 = done
    let mut color: HashMap<String, u8> = HashMap::new();
    let mut back_edges = HashSet::new();

    for entry in &self.entry_points {
      if color.contains_key(entry) {
        continue;
      }
      // Iterative DFS: (node, next outgoing position)
      let mut stack: Vec<(String, usize)> = vec![(entry.clone(), 0)];
      color.insert(entry.clone(), 1);

      while let Some((node, pos)) = stack.pop() {
        let out = self.outgoing(&node);
        if pos < out.len() {
          let idx = out[pos];
          stack.push((node, pos + 1));
          let target = &self.edges[idx].target_id;
          match color.get(target) {
            Some(1) => {
              back_edges.insert(idx);
            }
            Some(_) => {}
            None => {
              color.insert(target.clone(), 1);
              stack.push((target.clone(), 0));
            }
          }
        } else {
          color.insert(node, 2);
        }
      }
    }

    self.reachable = color.into_keys().collect();
    self.back_edges = back_edges;
  }

  /// Get entry points (nodes with no incoming edges).
  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  pub fn edge(&self, idx: usize) -> &EdgeDef {
    &self.edges[idx]
  }

  /// Indices of a node's outgoing edges.
  pub fn outgoing(&self, node_id: &str) -> &[usize] {
    self
      .outgoing
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Incoming edges that gate readiness (back edges excluded).
  pub fn forward_incoming(&self, node_id: &str) -> Vec<usize> {
    self
      .incoming
      .get(node_id)
      .map(|v| {
        v.iter()
          .copied()
          .filter(|idx| !self.back_edges.contains(idx))
          .collect()
      })
      .unwrap_or_default()
  }

  /// Get upstream nodes for a given node, ignoring back edges.
  pub fn upstream(&self, node_id: &str) -> Vec<&str> {
    self
      .forward_incoming(node_id)
      .into_iter()
      .map(|idx| self.edges[idx].source_id.as_str())
      .collect()
  }

  pub fn has_incoming(&self, node_id: &str) -> bool {
    self.incoming.get(node_id).is_some_and(|v| !v.is_empty())
  }

  pub fn has_edge(&self, from: &str, to: &str) -> bool {
    self
      .outgoing(from)
      .iter()
      .any(|idx| self.edges[*idx].target_id == to)
  }

  pub fn is_reachable(&self, node_id: &str) -> bool {
    self.reachable.contains(node_id)
  }
}
