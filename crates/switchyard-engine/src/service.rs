//! Execution service: background runs addressed by execution id.
//!
//! The [`WorkflowService`] validates a run synchronously, then drives it on
//! a spawned task. Callers poll [`status`](WorkflowService::status), await
//! [`wait`](WorkflowService::wait), or stop a run with
//! [`cancel`](WorkflowService::cancel). Finished executions stay
//! addressable (for `status` and `resume`) until more than
//! [`DEFAULT_RETAINED_EXECUTIONS`] of them pile up; the oldest are then
//! forgotten.
//!
//! # Usage
//!
//! ```ignore
//! let service = WorkflowService::new(engine);
//! let execution_id = service.start(def, json!({"q": 1}), None).await?;
//! let record = service.wait(&execution_id).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use switchyard_config::WorkflowDef;
use switchyard_workflow::Workflow;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RunOverrides;
use crate::engine::{Engine, PreparedRun, RecordHandle};
use crate::error::EngineError;
use crate::result::ExecutionRecord;

/// Finished executions kept by [`WorkflowService::new`].
pub const DEFAULT_RETAINED_EXECUTIONS: usize = 256;

struct ExecutionHandle {
  /// Launch order, used to forget the oldest finished runs first.
  seq: u64,
  workflow: Arc<Workflow>,
  record: RecordHandle,
  cancel: CancellationToken,
  /// Flips to `true` once the record is final.
  done: watch::Receiver<bool>,
}

/// Starts, tracks and cancels workflow executions.
pub struct WorkflowService {
  engine: Engine,
  executions: RwLock<HashMap<String, ExecutionHandle>>,
  launched: AtomicU64,
  retained: usize,
  shutdown: CancellationToken,
}

impl WorkflowService {
  pub fn new(engine: Engine) -> Self {
    Self::with_retention(engine, DEFAULT_RETAINED_EXECUTIONS)
  }

  /// A service that remembers at most `retained` finished executions.
  /// Running executions are never forgotten.
  pub fn with_retention(engine: Engine, retained: usize) -> Self {
    Self {
      engine,
      executions: RwLock::new(HashMap::new()),
      launched: AtomicU64::new(0),
      retained,
      shutdown: CancellationToken::new(),
    }
  }

  pub fn engine(&self) -> &Engine {
    &self.engine
  }

  /// Validate and launch a run, returning its execution id.
  ///
  /// Graph and input errors are returned here and nothing is started.
  pub async fn start(
    &self,
    def: WorkflowDef,
    input: Value,
    overrides: Option<RunOverrides>,
  ) -> Result<String, EngineError> {
    let prepared = self
      .engine
      .prepare(def, input, &overrides.unwrap_or_default())?;
    Ok(self.launch(prepared).await)
  }

  /// Snapshot of an execution's record.
  pub async fn status(&self, execution_id: &str) -> Result<ExecutionRecord, EngineError> {
    let record = self.handle_record(execution_id).await?;
    let record = record.read().await;
    Ok(record.clone())
  }

  /// Signal cancellation. Cancelling a finished run has no effect.
  pub async fn cancel(&self, execution_id: &str) -> Result<(), EngineError> {
    let executions = self.executions.read().await;
    let handle = executions
      .get(execution_id)
      .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
    info!(execution_id = %execution_id, "cancelling execution");
    handle.cancel.cancel();
    Ok(())
  }

  /// Resume a finished execution of this service from a checkpoint.
  pub async fn resume(
    &self,
    execution_id: &str,
    checkpoint_id: Option<&str>,
  ) -> Result<String, EngineError> {
    let workflow = {
      let executions = self.executions.read().await;
      let handle = executions
        .get(execution_id)
        .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
      handle.workflow.clone()
    };
    self
      .resume_with(workflow.def().clone(), execution_id, checkpoint_id)
      .await
  }

  /// Resume an execution from the checkpoint store, supplying its definition.
  ///
  /// Works for executions started by another process. Refused while the
  /// execution is still running here.
  pub async fn resume_with(
    &self,
    def: WorkflowDef,
    execution_id: &str,
    checkpoint_id: Option<&str>,
  ) -> Result<String, EngineError> {
    if let Ok(record) = self.status(execution_id).await {
      if !record.status.is_terminal() {
        return Err(EngineError::InvalidState {
          message: format!("execution {execution_id} is still running"),
        });
      }
    }

    let prepared = self
      .engine
      .prepare_resume(def, execution_id, checkpoint_id)
      .await?;
    Ok(self.launch(prepared).await)
  }

  /// Wait until an execution is final and return its record.
  pub async fn wait(&self, execution_id: &str) -> Result<ExecutionRecord, EngineError> {
    let mut done = {
      let executions = self.executions.read().await;
      let handle = executions
        .get(execution_id)
        .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
      handle.done.clone()
    };
    // An error means the run task is gone; the record is as final as it gets.
    let _ = done.wait_for(|finished| *finished).await;
    self.status(execution_id).await
  }

  /// Ids of every execution this service knows about.
  pub async fn executions(&self) -> Vec<String> {
    self.executions.read().await.keys().cloned().collect()
  }

  /// Cancel every run started by this service.
  pub fn shutdown(&self) {
    info!("shutting down workflow service");
    self.shutdown.cancel();
  }

  async fn handle_record(&self, execution_id: &str) -> Result<RecordHandle, EngineError> {
    let executions = self.executions.read().await;
    executions
      .get(execution_id)
      .map(|handle| handle.record.clone())
      .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
  }

  async fn launch(&self, prepared: PreparedRun) -> String {
    let execution_id = prepared.execution_id().to_string();
    let workflow = prepared.workflow().clone();
    let record: RecordHandle = Arc::new(RwLock::new(prepared.initial_record()));
    let cancel = self.shutdown.child_token();
    let (done_tx, done_rx) = watch::channel(false);
    let seq = self.launched.fetch_add(1, Ordering::SeqCst);

    let mut executions = self.executions.write().await;
    self.forget_oldest_finished(&mut executions);
    executions.insert(
      execution_id.clone(),
      ExecutionHandle {
        seq,
        workflow: workflow.clone(),
        record: record.clone(),
        cancel: cancel.clone(),
        done: done_rx,
      },
    );
    drop(executions);

    info!(
      execution_id = %execution_id,
      workflow_id = %workflow.id(),
      "launching execution"
    );
    let engine = self.engine.clone();
    tokio::spawn(async move {
      engine.run_with_record(prepared, record, cancel).await;
      let _ = done_tx.send(true);
    });

    execution_id
  }

  fn forget_oldest_finished(&self, executions: &mut HashMap<String, ExecutionHandle>) {
    let mut finished: Vec<(u64, String)> = executions
      .iter()
      .filter(|(_, handle)| *handle.done.borrow())
      .map(|(id, handle)| (handle.seq, id.clone()))
      .collect();
    if finished.len() <= self.retained {
      return;
    }
    finished.sort();
    let excess = finished.len() - self.retained;
    for (_, id) in finished.into_iter().take(excess) {
      debug!(execution_id = %id, "forgetting finished execution");
      executions.remove(&id);
    }
  }
}

impl Drop for WorkflowService {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}
