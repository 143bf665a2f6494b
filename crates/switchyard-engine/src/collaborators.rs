//! Traits for the external systems the engine calls, plus simple in-process
//! implementations used by the CLI and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchyard_config::WorkflowDef;
use thiserror::Error;
use tokio::sync::Notify;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct CollaboratorError {
  pub message: String,
  /// Whether the same call may succeed if repeated.
  pub retryable: bool,
}

impl CollaboratorError {
  pub fn retryable(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      retryable: true,
    }
  }

  pub fn permanent(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      retryable: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
  pub execution_id: String,
  pub node_id: String,
  pub agent_id: String,
  /// Effective instructions after node overrides were applied.
  pub instructions: Option<String>,
  pub input: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
  pub output: Value,
  #[serde(default)]
  pub tokens_used: u64,
  #[serde(default)]
  pub cost_usd: f64,
  #[serde(default)]
  pub api_calls: u64,
}

/// Invokes an agent and awaits its response.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
  async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, CollaboratorError>;
}

/// Agent that returns its input unchanged and reports one API call.
#[derive(Debug, Clone, Default)]
pub struct EchoAgent;

#[async_trait]
impl AgentInvoker for EchoAgent {
  async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, CollaboratorError> {
    Ok(AgentResponse {
      output: request.input,
      tokens_used: 0,
      cost_usd: 0.0,
      api_calls: 1,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
  pub execution_id: String,
  pub node_id: String,
  pub prompt: String,
  pub options: Vec<String>,
  /// Input of the approval node, shown to the approver.
  pub context: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
  /// One of the request's options.
  pub option: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub comment: Option<String>,
}

/// Channel to the humans who approve gated steps.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
  /// Wait for a decision. The engine bounds the wait with its own timeout.
  async fn request_approval(
    &self,
    request: &ApprovalRequest,
  ) -> Result<ApprovalDecision, CollaboratorError>;

  /// Re-notify about a pending request, optionally to someone else.
  async fn escalate(
    &self,
    _request: &ApprovalRequest,
    _escalate_to: Option<&str>,
  ) -> Result<(), CollaboratorError> {
    Ok(())
  }
}

/// Approval channel that immediately answers with a fixed option.
#[derive(Debug, Clone)]
pub struct AutoApprove {
  option: String,
}

impl AutoApprove {
  pub fn new(option: impl Into<String>) -> Self {
    Self {
      option: option.into(),
    }
  }
}

impl Default for AutoApprove {
  fn default() -> Self {
    Self::new("approve")
  }
}

#[async_trait]
impl ApprovalChannel for AutoApprove {
  async fn request_approval(
    &self,
    request: &ApprovalRequest,
  ) -> Result<ApprovalDecision, CollaboratorError> {
    let option = if request.options.contains(&self.option) {
      self.option.clone()
    } else {
      request
        .options
        .first()
        .cloned()
        .ok_or_else(|| CollaboratorError::permanent("approval request has no options"))?
    };
    Ok(ApprovalDecision {
      option,
      comment: None,
    })
  }
}

/// Source of named external events awaited by trigger nodes.
#[async_trait]
pub trait EventSource: Send + Sync {
  /// Wait for the next payload published under `event_name`.
  async fn wait_for(&self, event_name: &str) -> Result<Value, CollaboratorError>;
}

/// In-process event source fed through [`ChannelEventSource::publish`].
///
/// Payloads published before anyone waits are queued per event name.
#[derive(Debug, Default)]
pub struct ChannelEventSource {
  queues: Mutex<HashMap<String, VecDeque<Value>>>,
  published: Notify,
}

impl ChannelEventSource {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn publish(&self, event_name: impl Into<String>, payload: Value) {
    self
      .queues
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .entry(event_name.into())
      .or_default()
      .push_back(payload);
    self.published.notify_waiters();
  }

  fn take(&self, event_name: &str) -> Option<Value> {
    self
      .queues
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .get_mut(event_name)
      .and_then(VecDeque::pop_front)
  }
}

#[async_trait]
impl EventSource for ChannelEventSource {
  async fn wait_for(&self, event_name: &str) -> Result<Value, CollaboratorError> {
    loop {
      // Register interest before checking so a publish in between is seen.
      let notified = self.published.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if let Some(payload) = self.take(event_name) {
        return Ok(payload);
      }
      notified.await;
    }
  }
}

/// Lookup of workflow definitions referenced by sub-workflow nodes.
#[async_trait]
pub trait WorkflowRegistry: Send + Sync {
  /// Fetch a definition; `None` version means the latest registered.
  async fn get(
    &self,
    workflow_id: &str,
    version: Option<&str>,
  ) -> Result<Option<WorkflowDef>, CollaboratorError>;
}

#[derive(Debug, Default)]
pub struct InMemoryWorkflowRegistry {
  definitions: RwLock<HashMap<String, Vec<WorkflowDef>>>,
}

impl InMemoryWorkflowRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, def: WorkflowDef) {
    self
      .definitions
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .entry(def.id.clone())
      .or_default()
      .push(def);
  }
}

#[async_trait]
impl WorkflowRegistry for InMemoryWorkflowRegistry {
  async fn get(
    &self,
    workflow_id: &str,
    version: Option<&str>,
  ) -> Result<Option<WorkflowDef>, CollaboratorError> {
    let definitions = self.definitions.read().unwrap_or_else(|e| e.into_inner());
    let Some(versions) = definitions.get(workflow_id) else {
      return Ok(None);
    };
    let found = match version {
      Some(version) => versions
        .iter()
        .rev()
        .find(|d| d.version.as_deref() == Some(version)),
      None => versions.last(),
    };
    Ok(found.cloned())
  }
}
