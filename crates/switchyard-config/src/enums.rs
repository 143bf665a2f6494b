use serde::{Deserialize, Serialize};

/// How the scheduler dispatches eligible nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
  /// One node at a time, in declaration order.
  Sequential,
  /// Up to `max_parallel_executions` nodes, refilled as each completes.
  #[default]
  Parallel,
  /// Same dispatch as `Parallel`; results are committed as they stream in.
  Streaming,
  /// Waves of ready nodes; a wave is fully joined before the next scan.
  Batch,
  /// External-trigger nodes are awaited before anything else is scheduled.
  EventDriven,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
  FailFast,
  #[default]
  RetryThenFail,
  SkipAndContinue,
  FallbackThenContinue,
  /// Defer to the failing node's own `error_handling`.
  Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
  #[serde(alias = "fixed")]
  Constant,
  Linear,
  #[default]
  Exponential,
  None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
  ForEach,
  While,
  Until,
  FixedCount,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
  #[default]
  WaitAll,
  WaitAny,
  WaitFirstN,
  WaitTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
  Merge,
  Concat,
  Sum,
  Average,
  Min,
  Max,
  Collect,
  Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageOperation {
  Save,
  Load,
  Delete,
  Update,
  Append,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFormat {
  #[default]
  Json,
  Text,
}

/// Target type of a `convert` transform operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvertTarget {
  String,
  Number,
  Integer,
  Boolean,
  Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
  String,
  Number,
  Integer,
  Boolean,
  Array,
  Object,
  #[default]
  Any,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
  Global,
  Local,
  #[default]
  Input,
  Output,
}
