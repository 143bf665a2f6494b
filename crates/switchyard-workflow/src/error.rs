use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("duplicate node id: {0}")]
  DuplicateNode(String),

  #[error("edge references unknown node: from={from}, to={to}")]
  InvalidEdge { from: String, to: String },

  #[error("no entry points found (all nodes have incoming edges)")]
  NoEntryPoints,

  #[error("cycle detected through unconditioned edges at node: {node_id}")]
  CycleDetected { node_id: String },

  #[error("node is unreachable from any entry point: {0}")]
  UnreachableNode(String),

  #[error("invalid configuration for node '{node_id}': {message}")]
  InvalidNodeConfig { node_id: String, message: String },
}
