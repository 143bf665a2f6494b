//! Switchyard Engine
//!
//! This crate runs validated workflows: it resolves expressions against the
//! execution context, schedules ready nodes, dispatches them to the node
//! executors under the run's budget and error policy, and checkpoints
//! progress so a run can be resumed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowService                         │
//! │  - start(def, input, overrides) → execution id              │
//! │  - status / cancel / resume / wait                          │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │  - input validation, checkpoint load                        │
//! │  - drives a scope: scan → dispatch → commit                 │
//! │  - loop / parallel / sub-workflow drive nested scopes       │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Task + executors                         │
//! │  - budget check, cache, timeout, retry, fallback            │
//! │  - one executor per node kind                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use switchyard_engine::{Collaborators, Engine, EngineConfig, RunOverrides};
//! use tokio_util::sync::CancellationToken;
//!
//! let engine = Engine::new(EngineConfig::default(), Collaborators::default());
//! let record = engine
//!   .execute(def, json!({"query": "hello"}), RunOverrides::default(), CancellationToken::new())
//!   .await?;
//! println!("{}", record.output);
//! ```

mod budget;
mod checkpoint;
mod collaborators;
mod config;
mod context;
mod engine;
mod error;
mod events;
mod executors;
pub mod expr;
mod path;
mod policy;
mod result;
mod scheduler;
pub mod schema;
mod service;
mod task;
mod variables;

pub use budget::{BudgetLimits, BudgetTracker, BudgetUsage, ResourceUsage};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use collaborators::{
  AgentInvoker, AgentRequest, AgentResponse, ApprovalChannel, ApprovalDecision, ApprovalRequest,
  AutoApprove, ChannelEventSource, CollaboratorError, EchoAgent, EventSource,
  InMemoryWorkflowRegistry, WorkflowRegistry,
};
pub use config::{EngineConfig, RunOverrides};
pub use context::ExecutionContext;
pub use engine::{Collaborators, Engine, PreparedRun, RecordHandle};
pub use error::{EngineError, ErrorKind, NodeExecutionError, ValidationError};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use expr::ExprError;
pub use policy::{Decision, ErrorPolicy};
pub use result::{
  ExecutionFailure, ExecutionRecord, ExecutionStatus, NodeResult, NodeStatus, Route,
};
pub use scheduler::{NodeState, SchedulerState};
pub use service::{DEFAULT_RETAINED_EXECUTIONS, WorkflowService};
pub use variables::validate_input;
