use serde::{Deserialize, Serialize};

use crate::edge::DataMapping;
use crate::enums::{
  AggregationMethod, ConvertTarget, ErrorStrategy, LoopKind, StorageFormat, StorageOperation,
  WaitStrategy,
};
use crate::settings::RetryConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(flatten)]
  pub kind: NodeKind,
  /// Input template resolved against the context before execution.
  ///
  /// When absent the node receives the merged output of its upstream nodes.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub input: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry: Option<RetryConfig>,
  /// Node-scoped strategy, consulted when the workflow strategy is `custom`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_handling: Option<ErrorStrategy>,
  /// Node run in place of this one when it fails under a fallback strategy.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fallback_node: Option<String>,
  #[serde(default)]
  pub cache_results: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cache_ttl_seconds: Option<u64>,
}

impl NodeDef {
  /// Create a node with default per-node settings.
  pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
    Self {
      id: id.into(),
      name: None,
      kind,
      input: None,
      timeout_ms: None,
      retry: None,
      error_handling: None,
      fallback_node: None,
      cache_results: false,
      cache_ttl_seconds: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
  Agent {
    agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    instructions_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    instructions_append: Option<String>,
  },
  Decision {
    #[serde(default)]
    branches: Vec<ConditionBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_target: Option<String>,
  },
  Transform {
    #[serde(default)]
    operations: Vec<TransformOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    validation_schema: Option<serde_json::Value>,
  },
  Loop {
    loop_type: LoopKind,
    /// Path of the array iterated by `for_each`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    /// Re-evaluated before every `while` pass and after every `until` pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    count: Option<u32>,
    /// Ids of the nodes forming the loop body.
    body: Vec<String>,
    #[serde(default = "default_iteration_variable")]
    iteration_variable: String,
    #[serde(default = "default_max_iterations")]
    max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    break_condition: Option<String>,
  },
  Parallel {
    branches: Vec<ParallelBranch>,
    #[serde(default)]
    wait_strategy: WaitStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wait_count: Option<usize>,
    /// Deadline for `wait_timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deadline_ms: Option<u64>,
  },
  HumanInLoop {
    prompt: String,
    #[serde(default = "default_approval_options")]
    options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    approval_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    escalation_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    escalation_to: Option<String>,
    /// Downstream node taken exclusively when the outcome is a rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rejected_target: Option<String>,
  },
  Storage {
    operation: StorageOperation,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
    #[serde(default)]
    format: StorageFormat,
    #[serde(default)]
    versioned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<serde_json::Value>,
  },
  ErrorHandler {
    /// Error kinds this handler accepts; empty accepts every kind.
    #[serde(default)]
    error_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fallback_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recovery: Option<serde_json::Value>,
  },
  Aggregator {
    method: AggregationMethod,
    /// Nodes whose outputs are combined; defaults to every upstream node.
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_path: Option<String>,
    /// Expression evaluated with `values` bound, for the `custom` method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expression: Option<String>,
  },
  ExternalTrigger {
    event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wait_timeout_ms: Option<u64>,
  },
  SubWorkflow {
    workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default)]
    input_mapping: Vec<DataMapping>,
    #[serde(default)]
    output_mapping: Vec<DataMapping>,
  },
}

impl NodeKind {
  /// Snake-case name of the kind, as written in definitions.
  pub fn name(&self) -> &'static str {
    match self {
      NodeKind::Agent { .. } => "agent",
      NodeKind::Decision { .. } => "decision",
      NodeKind::Transform { .. } => "transform",
      NodeKind::Loop { .. } => "loop",
      NodeKind::Parallel { .. } => "parallel",
      NodeKind::HumanInLoop { .. } => "human_in_loop",
      NodeKind::Storage { .. } => "storage",
      NodeKind::ErrorHandler { .. } => "error_handler",
      NodeKind::Aggregator { .. } => "aggregator",
      NodeKind::ExternalTrigger { .. } => "external_trigger",
      NodeKind::SubWorkflow { .. } => "sub_workflow",
    }
  }
}

/// One branch of a decision node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionBranch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  pub expression: String,
  pub target: String,
  #[serde(default)]
  pub priority: i32,
}

/// One branch of a parallel node: a set of nodes run as an isolated subgraph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBranch {
  pub id: String,
  pub nodes: Vec<String>,
  #[serde(default = "default_true")]
  pub required: bool,
}

/// A single field operation applied by a transform node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
  Set { path: String, value: serde_json::Value },
  Append { path: String, value: serde_json::Value },
  Prepend { path: String, value: serde_json::Value },
  Delete { path: String },
  Rename { from: String, to: String },
  Convert { path: String, to: ConvertTarget },
}

fn default_iteration_variable() -> String {
  "item".to_string()
}

fn default_max_iterations() -> u32 {
  1000
}

fn default_approval_options() -> Vec<String> {
  vec![
    "approve".to_string(),
    "reject".to_string(),
    "modify".to_string(),
  ]
}

fn default_true() -> bool {
  true
}
