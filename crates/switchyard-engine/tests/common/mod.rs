//! Collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use switchyard_config::WorkflowDef;
use switchyard_engine::{
  AgentInvoker, AgentRequest, AgentResponse, CollaboratorError, Collaborators, Engine,
  EngineConfig, ExecutionRecord, NodeStatus,
};
use switchyard_store::{CheckpointError, CheckpointStore};

/// Agent whose behaviour is picked by its `agent_id`:
///
/// - `sleep:<ms>` answers after a delay
/// - `tokens:<n>` reports `n` tokens used
/// - `fail` fails permanently
/// - `flaky` fails permanently until [`ScriptedAgent::heal`] is called
///
/// Anything else echoes. Every call is recorded by node id, and the
/// highest number of calls in flight at once is kept.
#[derive(Default)]
pub struct ScriptedAgent {
  calls: Mutex<Vec<String>>,
  healed: AtomicBool,
  in_flight: AtomicUsize,
  peak: AtomicUsize,
}

/// Counts a call as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl ScriptedAgent {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn count(&self, node_id: &str) -> usize {
    self.calls().iter().filter(|id| *id == node_id).count()
  }

  pub fn heal(&self) {
    self.healed.store(true, Ordering::SeqCst);
  }

  pub fn peak_in_flight(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
  async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, CollaboratorError> {
    self.calls.lock().unwrap().push(request.node_id.clone());
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    let _in_flight = InFlight(&self.in_flight);
    let (verb, arg) = request
      .agent_id
      .split_once(':')
      .unwrap_or((request.agent_id.as_str(), ""));
    let output = json!({"node": request.node_id, "input": request.input});

    match verb {
      "sleep" => {
        tokio::time::sleep(Duration::from_millis(arg.parse().unwrap())).await;
        Ok(AgentResponse {
          output,
          ..Default::default()
        })
      }
      "tokens" => Ok(AgentResponse {
        output,
        tokens_used: arg.parse().unwrap(),
        ..Default::default()
      }),
      "fail" => Err(CollaboratorError::permanent("scripted failure")),
      "flaky" if !self.healed.load(Ordering::SeqCst) => {
        Err(CollaboratorError::permanent("not yet"))
      }
      _ => Ok(AgentResponse {
        output,
        api_calls: 1,
        ..Default::default()
      }),
    }
  }
}

/// Checkpoint store that keeps only the first snapshot of each execution.
#[derive(Default)]
pub struct FirstCheckpointStore {
  snapshots: Mutex<HashMap<String, Value>>,
}

#[async_trait]
impl CheckpointStore for FirstCheckpointStore {
  async fn save(&self, execution_id: &str, snapshot: &Value) -> Result<(), CheckpointError> {
    self
      .snapshots
      .lock()
      .unwrap()
      .entry(execution_id.to_string())
      .or_insert_with(|| snapshot.clone());
    Ok(())
  }

  async fn load(&self, execution_id: &str) -> Result<Option<Value>, CheckpointError> {
    Ok(self.snapshots.lock().unwrap().get(execution_id).cloned())
  }

  async fn delete(&self, execution_id: &str) -> Result<(), CheckpointError> {
    self.snapshots.lock().unwrap().remove(execution_id);
    Ok(())
  }
}

pub fn def(value: Value) -> WorkflowDef {
  serde_json::from_value(value).unwrap()
}

pub fn engine(agent: Arc<ScriptedAgent>) -> Engine {
  Engine::new(
    EngineConfig::default(),
    Collaborators {
      agents: agent,
      ..Default::default()
    },
  )
}

pub fn agent(id: &str, agent_id: &str) -> Value {
  json!({"id": id, "kind": "agent", "agent_id": agent_id})
}

pub fn edge(source: &str, target: &str) -> Value {
  json!({"source_id": source, "target_id": target})
}

/// Status of the last recorded attempt of `node_id`.
pub fn status_of(record: &ExecutionRecord, node_id: &str) -> Option<NodeStatus> {
  record
    .node_results
    .iter()
    .rev()
    .find(|r| r.node_id == node_id)
    .map(|r| r.status)
}
