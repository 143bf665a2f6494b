use serde::{Deserialize, Serialize};
use switchyard_store::CheckpointError;
use switchyard_workflow::WorkflowError;
use thiserror::Error;

use crate::expr::ExprError;

/// Runtime input rejected before any node runs.
#[derive(Debug, Error)]
pub enum ValidationError {
  #[error("input payload must be a JSON object")]
  InputNotObject,

  #[error("missing required variable: {name}")]
  MissingVariable { name: String },

  #[error("variable '{name}' has the wrong type: expected {expected}")]
  TypeMismatch { name: String, expected: String },

  #[error("variable '{name}' failed validation: {message}")]
  RuleViolation { name: String, message: String },
}

/// Failure category attached to a [`NodeExecutionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Timeout,
  Collaborator,
  Expression,
  SchemaViolation,
  NoBranchMatched,
  Rejected,
  Storage,
  NotFound,
  BudgetExceeded,
  Cancelled,
  InvalidConfig,
  Internal,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::Timeout => "timeout",
      ErrorKind::Collaborator => "collaborator",
      ErrorKind::Expression => "expression",
      ErrorKind::SchemaViolation => "schema_violation",
      ErrorKind::NoBranchMatched => "no_branch_matched",
      ErrorKind::Rejected => "rejected",
      ErrorKind::Storage => "storage",
      ErrorKind::NotFound => "not_found",
      ErrorKind::BudgetExceeded => "budget_exceeded",
      ErrorKind::Cancelled => "cancelled",
      ErrorKind::InvalidConfig => "invalid_config",
      ErrorKind::Internal => "internal",
    }
  }
}

impl std::fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A node attempt failure, including budget rejections.
///
/// Serialized into the trace as `{kind, message, retryable}`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct NodeExecutionError {
  pub kind: ErrorKind,
  pub message: String,
  #[serde(default)]
  pub retryable: bool,
}

impl NodeExecutionError {
  pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
    Self {
      kind,
      message: message.into(),
      retryable,
    }
  }

  pub fn timeout(timeout_ms: u64) -> Self {
    Self::new(
      ErrorKind::Timeout,
      format!("timed out after {timeout_ms}ms"),
      true,
    )
  }

  pub fn collaborator(message: impl Into<String>, retryable: bool) -> Self {
    Self::new(ErrorKind::Collaborator, message, retryable)
  }

  pub fn schema(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::SchemaViolation, message, false)
  }

  pub fn budget(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::BudgetExceeded, message, false)
  }

  pub fn cancelled() -> Self {
    Self::new(ErrorKind::Cancelled, "execution cancelled", false)
  }

  pub fn invalid_config(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::InvalidConfig, message, false)
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Internal, message, false)
  }

  pub fn is_budget_exceeded(&self) -> bool {
    self.kind == ErrorKind::BudgetExceeded
  }
}

impl From<ExprError> for NodeExecutionError {
  fn from(err: ExprError) -> Self {
    Self::new(ErrorKind::Expression, err.to_string(), false)
  }
}

/// Errors returned to callers of the engine and the execution service.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error("input validation failed: {0}")]
  Validation(#[from] ValidationError),

  #[error("invalid workflow graph: {0}")]
  Graph(#[from] WorkflowError),

  #[error(transparent)]
  Checkpoint(#[from] CheckpointError),

  #[error("execution not found: {0}")]
  ExecutionNotFound(String),

  #[error("invalid state: {message}")]
  InvalidState { message: String },
}
