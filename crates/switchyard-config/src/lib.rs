//! Switchyard Config
//!
//! This crate contains the serializable workflow configuration types for switchyard.
//! These types represent workflow definitions before they are validated and
//! locked by `switchyard-workflow`.
//!
//! Configuration can be loaded from:
//! - JSON files (via the CLI)
//! - Any store holding definitions as JSON blobs
//!
//! Every field with a sensible default is optional in the JSON form, so the
//! smallest useful definition is a list of nodes and edges.

mod edge;
mod enums;
mod node;
mod settings;
mod variable;
mod workflow;

pub use edge::{DataMapping, EdgeDef};
pub use enums::{
  AggregationMethod, ConvertTarget, ErrorStrategy, ExecutionMode, LoopKind, RetryBackoff,
  StorageFormat, StorageOperation, VariableScope, VariableType, WaitStrategy,
};
pub use node::{ConditionBranch, NodeDef, NodeKind, ParallelBranch, TransformOp};
pub use settings::{RetryConfig, WorkflowSettings};
pub use variable::{ValidationRule, VariableDef};
pub use workflow::WorkflowDef;
