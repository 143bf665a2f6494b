//! Execution coordinator.
//!
//! The [`Engine`] validates a run, then drives the top-level scope of the
//! workflow until every node is terminal, a node fails terminally or the
//! run is cancelled. Loop iterations, parallel branches and sub-workflows
//! are driven by the same loop over their own scope.

use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{Map, Value};
use switchyard_config::{ExecutionMode, NodeKind, VariableScope, WorkflowDef, WorkflowSettings};
use switchyard_store::{CheckpointStore, KvStore, MemoryCheckpointStore, MemoryKvStore};
use switchyard_workflow::Workflow;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::budget::{BudgetLimits, BudgetTracker, BudgetUsage};
use crate::checkpoint::{self, Checkpoint, CheckpointManager};
use crate::collaborators::{
  AgentInvoker, ApprovalChannel, AutoApprove, ChannelEventSource, EchoAgent, EventSource,
  InMemoryWorkflowRegistry, WorkflowRegistry,
};
use crate::config::{EngineConfig, RunOverrides};
use crate::context::ExecutionContext;
use crate::error::{EngineError, ErrorKind, NodeExecutionError};
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::expr;
use crate::policy::ErrorPolicy;
use crate::result::{ExecutionFailure, ExecutionRecord, ExecutionStatus, NodeResult};
use crate::scheduler::{NodeState, ReadyNode, Scheduler, SchedulerState};
use crate::task::{self, NodeOutcome, NodeRun};
use crate::variables::validate_input;

/// Shared, live view of a run's record.
pub type RecordHandle = Arc<RwLock<ExecutionRecord>>;

/// External systems the engine calls.
#[derive(Clone)]
pub struct Collaborators {
  pub agents: Arc<dyn AgentInvoker>,
  pub storage: Arc<dyn KvStore>,
  pub approvals: Arc<dyn ApprovalChannel>,
  pub events: Arc<dyn EventSource>,
  pub workflows: Arc<dyn WorkflowRegistry>,
  pub checkpoints: Arc<dyn CheckpointStore>,
  pub notifier: Arc<dyn ExecutionNotifier>,
}

impl Default for Collaborators {
  fn default() -> Self {
    Self {
      agents: Arc::new(EchoAgent),
      storage: Arc::new(MemoryKvStore::new()),
      approvals: Arc::new(AutoApprove::default()),
      events: Arc::new(ChannelEventSource::new()),
      workflows: Arc::new(InMemoryWorkflowRegistry::new()),
      checkpoints: Arc::new(MemoryCheckpointStore::new()),
      notifier: Arc::new(NoopNotifier),
    }
  }
}

/// The workflow execution engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
  inner: Arc<EngineInner>,
}

struct EngineInner {
  config: EngineConfig,
  collaborators: Collaborators,
}

/// A run that passed validation and is ready to be driven.
pub struct PreparedRun {
  pub(crate) execution_id: String,
  pub(crate) workflow: Arc<Workflow>,
  pub(crate) settings: WorkflowSettings,
  pub(crate) timeout_override_ms: Option<u64>,
  pub(crate) context: ExecutionContext,
  pub(crate) scheduler: Option<SchedulerState>,
  pub(crate) node_results: Vec<NodeResult>,
  pub(crate) usage: BudgetUsage,
  pub(crate) started_at: DateTime<Utc>,
  pub(crate) resumed_from: Option<String>,
  pub(crate) sequence: u64,
}

impl PreparedRun {
  pub fn execution_id(&self) -> &str {
    &self.execution_id
  }

  pub fn workflow(&self) -> &Arc<Workflow> {
    &self.workflow
  }

  /// Record in `running` state, carrying the trace restored from a checkpoint.
  pub fn initial_record(&self) -> ExecutionRecord {
    let mut record = ExecutionRecord::new(&self.execution_id, self.workflow.id());
    record.started_at = self.started_at;
    record.node_results = self.node_results.clone();
    record.usage = self.usage.clone();
    record.resumed_from = self.resumed_from.clone();
    record
  }
}

impl Engine {
  pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
    Self {
      inner: Arc::new(EngineInner {
        config,
        collaborators,
      }),
    }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.inner.config
  }

  pub fn collaborators(&self) -> &Collaborators {
    &self.inner.collaborators
  }

  /// Validate a definition and its input. Nothing runs.
  pub fn prepare(
    &self,
    def: WorkflowDef,
    input: Value,
    overrides: &RunOverrides,
  ) -> Result<PreparedRun, EngineError> {
    let workflow = Workflow::from_def(def)?;
    self.prepare_workflow(Arc::new(workflow), input, overrides)
  }

  /// Validate the input for an already validated workflow.
  pub fn prepare_workflow(
    &self,
    workflow: Arc<Workflow>,
    input: Value,
    overrides: &RunOverrides,
  ) -> Result<PreparedRun, EngineError> {
    let settings = overrides.apply(workflow.settings());
    let input = match overrides.merge_input(input) {
      Value::Null => Value::Object(Map::new()),
      other => other,
    };
    let variables = validate_input(&workflow.def().variables, &input)?;

    Ok(PreparedRun {
      execution_id: uuid::Uuid::new_v4().to_string(),
      workflow,
      settings,
      timeout_override_ms: overrides.timeout_override_ms,
      context: ExecutionContext::new(input, variables),
      scheduler: None,
      node_results: Vec::new(),
      usage: BudgetUsage::default(),
      started_at: Utc::now(),
      resumed_from: None,
      sequence: 0,
    })
  }

  /// Load the latest checkpoint of an execution and prepare to continue it.
  pub async fn prepare_resume(
    &self,
    def: WorkflowDef,
    execution_id: &str,
    checkpoint_id: Option<&str>,
  ) -> Result<PreparedRun, EngineError> {
    let workflow = Workflow::from_def(def)?;
    let checkpoint = checkpoint::load(
      self.inner.collaborators.checkpoints.as_ref(),
      execution_id,
      checkpoint_id,
      &workflow,
    )
    .await?;

    let Checkpoint {
      checkpoint_id,
      execution_id,
      sequence,
      started_at,
      settings,
      timeout_override_ms,
      context,
      scheduler,
      node_results,
      usage,
      ..
    } = checkpoint;

    Ok(PreparedRun {
      execution_id,
      workflow: Arc::new(workflow),
      settings,
      timeout_override_ms,
      context,
      scheduler: Some(scheduler),
      node_results,
      usage,
      started_at,
      resumed_from: Some(checkpoint_id),
      sequence,
    })
  }

  /// Validate and run a workflow to completion.
  pub async fn execute(
    &self,
    def: WorkflowDef,
    input: Value,
    overrides: RunOverrides,
    cancel: CancellationToken,
  ) -> Result<ExecutionRecord, EngineError> {
    let prepared = self.prepare(def, input, &overrides)?;
    Ok(self.run(prepared, cancel).await)
  }

  /// Continue an execution from its latest checkpoint.
  pub async fn resume(
    &self,
    def: WorkflowDef,
    execution_id: &str,
    checkpoint_id: Option<&str>,
    cancel: CancellationToken,
  ) -> Result<ExecutionRecord, EngineError> {
    let prepared = self.prepare_resume(def, execution_id, checkpoint_id).await?;
    Ok(self.run(prepared, cancel).await)
  }

  pub async fn run(&self, prepared: PreparedRun, cancel: CancellationToken) -> ExecutionRecord {
    let record = Arc::new(RwLock::new(prepared.initial_record()));
    self.run_with_record(prepared, record.clone(), cancel).await;
    let record = record.read().await;
    record.clone()
  }

  /// Drive a prepared run, keeping `record` current as nodes finish.
  #[instrument(
    name = "workflow_execute",
    skip(self, prepared, record, cancel),
    fields(
      workflow_id = %prepared.workflow.id(),
      execution_id = %prepared.execution_id,
    )
  )]
  pub async fn run_with_record(
    &self,
    prepared: PreparedRun,
    record: RecordHandle,
    cancel: CancellationToken,
  ) {
    let PreparedRun {
      execution_id,
      workflow,
      settings,
      timeout_override_ms,
      context,
      scheduler,
      usage,
      started_at,
      resumed_from,
      sequence,
      ..
    } = prepared;

    info!(
      execution_id = %execution_id,
      workflow_id = %workflow.id(),
      resumed_from = ?resumed_from,
      input = %context.input,
      "workflow_started"
    );
    self.notify(ExecutionEvent::WorkflowStarted {
      execution_id: execution_id.clone(),
      workflow_id: workflow.id().to_string(),
    });

    let budget = Arc::new(BudgetTracker::restore(
      BudgetLimits::from_settings(&settings),
      &usage,
    ));
    let slots = Arc::new(Semaphore::new(settings.max_parallel_executions.max(1)));
    let scope = RunScope {
      engine: self.clone(),
      workflow: workflow.clone(),
      execution_id: execution_id.clone(),
      policy: Arc::new(ErrorPolicy::new(workflow.def(), settings.continue_on_error)),
      settings: Arc::new(settings),
      budget: budget.clone(),
      slots,
      cancel,
      depth: 0,
      label: String::new(),
      timeout_override_ms,
    };

    let members = workflow.top_level();
    let scheduler = match scheduler {
      Some(state) => Scheduler::from_state(&workflow, &members, state),
      None => Scheduler::new(&workflow, &members),
    };
    let entry_input = context.input.clone();
    let mut state = ScopeState {
      members,
      entry_input,
      context,
      scheduler,
      results: Vec::new(),
    };
    let mut top = TopLevel {
      record: record.clone(),
      checkpoints: CheckpointManager::new(
        self.inner.collaborators.checkpoints.clone(),
        &scope.settings,
      )
      .with_sequence(sequence),
      flushed: 0,
    };

    let outcome = self.drive(&scope, &mut state, Some(&mut top)).await;

    top.flush(&scope, &state).await;
    if !matches!(outcome, ScopeOutcome::Completed) && top.checkpoints.is_enabled() {
      // Capture the final state so the run can be resumed from here.
      top.save_checkpoint(&scope, &state).await;
    }

    let (status, output, failure) = match outcome {
      ScopeOutcome::Completed => (
        ExecutionStatus::Completed,
        scope_output(&workflow, &state, true),
        None,
      ),
      ScopeOutcome::Failed { node_id, error } => (
        ExecutionStatus::Failed,
        Value::Null,
        Some(ExecutionFailure {
          node_id: Some(node_id),
          error,
        }),
      ),
      ScopeOutcome::Cancelled => (
        ExecutionStatus::Cancelled,
        Value::Null,
        Some(ExecutionFailure {
          node_id: None,
          error: NodeExecutionError::cancelled(),
        }),
      ),
    };

    let (finalized, tasks_executed) = {
      let mut record = record.write().await;
      let finalized = record.finalize(status, output, failure.clone(), budget.usage());
      (finalized, record.node_results.len())
    };
    if !finalized {
      warn!(execution_id = %execution_id, "execution record was already finalized");
      return;
    }

    match status {
      ExecutionStatus::Completed => {
        info!(
          execution_id = %execution_id,
          tasks_executed = tasks_executed,
          "workflow_completed"
        );
        self.notify(ExecutionEvent::WorkflowCompleted { execution_id });
      }
      ExecutionStatus::Cancelled => {
        warn!(execution_id = %execution_id, "workflow_cancelled");
        self.notify(ExecutionEvent::WorkflowCancelled { execution_id });
      }
      _ => {
        let message = failure
          .map(|f| match f.node_id {
            Some(node_id) => format!("node '{node_id}' failed: {}", f.error),
            None => f.error.to_string(),
          })
          .unwrap_or_default();
        error!(execution_id = %execution_id, error = %message, "workflow_failed");
        self.notify(ExecutionEvent::WorkflowFailed {
          execution_id,
          error: message,
        });
      }
    }
  }

  pub(crate) fn notify(&self, event: ExecutionEvent) {
    self.inner.collaborators.notifier.notify(event);
  }

  /// Run a scope until all of its nodes are terminal.
  ///
  /// Dispatch width follows the execution mode: one node at a time for
  /// `sequential`, as-completed up to `max_parallel_executions` for
  /// `parallel` and `streaming`, whole waves for `batch`. In `event_driven`
  /// mode pending external triggers are dispatched alone and first.
  pub(crate) fn drive<'a>(
    &'a self,
    scope: &'a RunScope,
    state: &'a mut ScopeState,
    mut top: Option<&'a mut TopLevel>,
  ) -> Pin<Box<dyn Future<Output = ScopeOutcome> + Send + 'a>> {
    Box::pin(async move {
      let mode = scope.settings.execution_mode;
      let limit = match mode {
        ExecutionMode::Sequential => 1,
        _ => scope.settings.max_parallel_executions.max(1),
      };
      let mut running: JoinSet<(String, Result<NodeRun, NodeExecutionError>)> = JoinSet::new();
      let mut running_triggers: HashSet<String> = HashSet::new();

      loop {
        if scope.cancel.is_cancelled() {
          running.shutdown().await;
          return ScopeOutcome::Cancelled;
        }

        let wave_open = mode != ExecutionMode::Batch || running.is_empty();
        if wave_open {
          let scan = state
            .scheduler
            .scan(&scope.workflow, &state.context.snapshot());
          let skipped_any = !scan.skipped.is_empty();
          for node_id in scan.skipped {
            record_untraversed(scope, state, &node_id);
          }

          let mut ready = scan.ready;
          if mode == ExecutionMode::EventDriven {
            let triggers_first =
              !running_triggers.is_empty() || ready.iter().any(|r| is_trigger(scope, r));
            if triggers_first {
              ready.retain(|r| is_trigger(scope, r));
            }
          }

          for ready_node in ready {
            if running.len() >= limit {
              break;
            }
            if is_trigger(scope, &ready_node) {
              running_triggers.insert(ready_node.node_id.clone());
            }
            dispatch(scope, state, ready_node, &mut running);
          }

          if skipped_any {
            if let Some(top) = top.as_deref_mut() {
              top.flush(scope, state).await;
            }
          }
        }

        if running.is_empty() {
          if state.scheduler.is_finished() {
            return ScopeOutcome::Completed;
          }
          let pending = state.scheduler.nodes_in(NodeState::Pending);
          error!(
            execution_id = %scope.execution_id,
            scope = %scope.label,
            pending = ?pending,
            "scheduler stalled with pending nodes"
          );
          return ScopeOutcome::Failed {
            node_id: pending.first().cloned().unwrap_or_default(),
            error: NodeExecutionError::internal(format!(
              "no runnable nodes left; pending: {}",
              pending.join(", ")
            )),
          };
        }

        let joined = tokio::select! {
          _ = scope.cancel.cancelled() => {
            running.shutdown().await;
            warn!(
              execution_id = %scope.execution_id,
              scope = %scope.label,
              "workflow cancelled during task execution"
            );
            return ScopeOutcome::Cancelled;
          }
          joined = running.join_next() => joined,
        };

        let Some(joined) = joined else {
          continue;
        };
        let (node_id, run) = match joined {
          Ok(pair) => pair,
          Err(e) => {
            running.shutdown().await;
            return ScopeOutcome::Failed {
              node_id: String::new(),
              error: NodeExecutionError::internal(format!("node task aborted: {e}")),
            };
          }
        };
        running_triggers.remove(&node_id);

        let run = run.unwrap_or_else(|error| NodeRun {
          node_id: node_id.clone(),
          results: vec![NodeResult::skipped(&node_id, &scope.label, Some(error.clone()))],
          outcome: NodeOutcome::Failed { error },
        });
        state.results.extend(run.results);

        match run.outcome {
          NodeOutcome::Completed {
            output,
            route,
            owned_outputs,
          } => {
            for (id, owned) in owned_outputs {
              state.context.set_output(id, owned);
            }
            state.context.set_output(node_id.clone(), output);
            state.scheduler.mark_completed(&node_id, route);
          }
          NodeOutcome::Skipped => state.scheduler.mark_skipped(&node_id),
          NodeOutcome::Failed { error } => {
            state.scheduler.mark_failed(&node_id);
            abandon_running(scope, state, &mut running, &node_id).await;
            if let Some(top) = top.as_deref_mut() {
              top.flush(scope, state).await;
            }
            return ScopeOutcome::Failed { node_id, error };
          }
          NodeOutcome::Cancelled => {
            running.shutdown().await;
            if let Some(top) = top.as_deref_mut() {
              top.flush(scope, state).await;
            }
            return ScopeOutcome::Cancelled;
          }
        }

        if let Some(top) = top.as_deref_mut() {
          top.after_commit(scope, state).await;
        }
      }
    })
  }
}

/// Everything a node of one scope needs to run.
#[derive(Clone)]
pub(crate) struct RunScope {
  pub engine: Engine,
  pub workflow: Arc<Workflow>,
  pub execution_id: String,
  pub settings: Arc<WorkflowSettings>,
  pub policy: Arc<ErrorPolicy>,
  /// Shared by every scope of the run, sub-workflows included.
  pub budget: Arc<BudgetTracker>,
  /// Run-wide `max_parallel_executions` permits. Held by working nodes
  /// only, so a loop, parallel or sub-workflow node never blocks its body.
  pub slots: Arc<Semaphore>,
  pub cancel: CancellationToken,
  /// Sub-workflow nesting depth.
  pub depth: usize,
  /// Path of this scope in the trace, empty at top level.
  pub label: String,
  pub timeout_override_ms: Option<u64>,
}

impl RunScope {
  pub fn collaborators(&self) -> &Collaborators {
    self.engine.collaborators()
  }

  pub fn notify(&self, event: ExecutionEvent) {
    self.engine.notify(event);
  }

  /// Label of a scope nested under this one.
  pub fn child_label(&self, name: &str) -> String {
    if self.label.is_empty() {
      name.to_string()
    } else {
      format!("{}/{name}", self.label)
    }
  }

  /// Same run, nested scope label.
  pub fn nested(&self, name: &str) -> RunScope {
    let mut scope = self.clone();
    scope.label = self.child_label(name);
    scope
  }
}

/// Mutable state of one scope while it is driven.
pub(crate) struct ScopeState {
  pub members: HashSet<String>,
  /// Input handed to nodes without incoming edges.
  pub entry_input: Value,
  pub context: ExecutionContext,
  pub scheduler: Scheduler,
  /// Attempts recorded in this scope, nested scopes included.
  pub results: Vec<NodeResult>,
}

impl ScopeState {
  pub fn new(
    workflow: &Workflow,
    members: HashSet<String>,
    entry_input: Value,
    context: ExecutionContext,
  ) -> Self {
    let scheduler = Scheduler::new(workflow, &members);
    Self {
      members,
      entry_input,
      context,
      scheduler,
      results: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ScopeOutcome {
  Completed,
  Failed {
    node_id: String,
    error: NodeExecutionError,
  },
  Cancelled,
}

/// Record and checkpoint bookkeeping for the top-level scope.
pub(crate) struct TopLevel {
  record: RecordHandle,
  checkpoints: CheckpointManager,
  /// Number of scope results already copied into the record.
  flushed: usize,
}

impl TopLevel {
  async fn flush(&mut self, scope: &RunScope, state: &ScopeState) {
    let mut record = self.record.write().await;
    if let Some(fresh) = state.results.get(self.flushed..) {
      record.node_results.extend_from_slice(fresh);
    }
    self.flushed = state.results.len();
    record.usage = scope.budget.usage();
  }

  async fn after_commit(&mut self, scope: &RunScope, state: &ScopeState) {
    self.flush(scope, state).await;
    if self.checkpoints.due() {
      self.save_checkpoint(scope, state).await;
    }
  }

  async fn save_checkpoint(&mut self, scope: &RunScope, state: &ScopeState) {
    let (started_at, node_results) = {
      let record = self.record.read().await;
      (record.started_at, record.node_results.clone())
    };
    let mut snapshot = Checkpoint::capture(
      &scope.execution_id,
      &scope.workflow,
      started_at,
      &scope.settings,
      &state.context,
      state.scheduler.state(),
      &node_results,
      scope.budget.usage(),
    );
    snapshot.timeout_override_ms = scope.timeout_override_ms;

    match self.checkpoints.save(snapshot).await {
      Ok(saved) => {
        info!(
          execution_id = %scope.execution_id,
          checkpoint_id = %saved.checkpoint_id,
          sequence = saved.sequence,
          completed = saved.completed.len(),
          "checkpoint_saved"
        );
        scope.notify(ExecutionEvent::CheckpointSaved {
          execution_id: scope.execution_id.clone(),
          checkpoint_id: saved.checkpoint_id,
          sequence: saved.sequence,
        });
      }
      Err(e) => {
        warn!(
          execution_id = %scope.execution_id,
          error = %e,
          "checkpoint save failed, continuing without it"
        );
      }
    }
  }
}

/// Abort the tasks still running beside a failed node and record each of
/// them as skipped, so the trace accounts for every dispatched node.
async fn abandon_running(
  scope: &RunScope,
  state: &mut ScopeState,
  running: &mut JoinSet<(String, Result<NodeRun, NodeExecutionError>)>,
  failed_node: &str,
) {
  running.shutdown().await;
  for node_id in state.scheduler.nodes_in(NodeState::Running) {
    warn!(
      execution_id = %scope.execution_id,
      node_id = %node_id,
      failed_node = %failed_node,
      "task_aborted"
    );
    let reason = NodeExecutionError::new(
      ErrorKind::Cancelled,
      format!("aborted after node '{failed_node}' failed"),
      false,
    );
    state
      .results
      .push(NodeResult::skipped(&node_id, &scope.label, Some(reason)));
  }
}

fn is_trigger(scope: &RunScope, ready: &ReadyNode) -> bool {
  scope
    .workflow
    .node(&ready.node_id)
    .is_some_and(|n| matches!(n.kind, NodeKind::ExternalTrigger { .. }))
}

fn record_untraversed(scope: &RunScope, state: &mut ScopeState, node_id: &str) {
  info!(
    execution_id = %scope.execution_id,
    node_id = %node_id,
    scope = %scope.label,
    "task_skipped"
  );
  state
    .results
    .push(NodeResult::skipped(node_id, &scope.label, None));
  scope.notify(ExecutionEvent::NodeSkipped {
    execution_id: scope.execution_id.clone(),
    node_id: node_id.to_string(),
  });
}

fn dispatch(
  scope: &RunScope,
  state: &mut ScopeState,
  ready: ReadyNode,
  running: &mut JoinSet<(String, Result<NodeRun, NodeExecutionError>)>,
) {
  let Some(node) = scope.workflow.node(&ready.node_id).cloned() else {
    state.scheduler.mark_skipped(&ready.node_id);
    return;
  };
  let input = resolve_input(scope, state, &ready);
  state.scheduler.mark_running(&node.id);

  let node_id = node.id.clone();
  let context = state.context.clone();
  let scope = scope.clone();
  running.spawn(guarded(node_id, task::run_node(scope, node, context, input)));
}

/// Build a node's input from its satisfied incoming edges.
///
/// An explicit `input` template wins. Otherwise a single predecessor passes
/// its output through, several are keyed by node id, and an entry node
/// receives the scope input. Edge data mappings are then applied in
/// ascending priority, so the highest priority writes last.
fn resolve_input(
  scope: &RunScope,
  state: &ScopeState,
  ready: &ReadyNode,
) -> Result<Value, NodeExecutionError> {
  let graph = scope.workflow.graph();
  let snapshot = state.context.snapshot();
  let node = scope.workflow.node(&ready.node_id);

  let mut sources: Vec<&str> = Vec::new();
  for idx in &ready.edges {
    let source = graph.edge(*idx).source_id.as_str();
    if !sources.contains(&source) {
      sources.push(source);
    }
  }

  let mut input = match node.and_then(|n| n.input.as_ref()) {
    Some(template) => expr::resolve_value(&snapshot, template)?,
    None => match sources.as_slice() {
      [] => state.entry_input.clone(),
      [single] => state.context.output(single).cloned().unwrap_or(Value::Null),
      many => Value::Object(
        many
          .iter()
          .map(|id| {
            let output = state.context.output(id).cloned().unwrap_or(Value::Null);
            (id.to_string(), output)
          })
          .collect(),
      ),
    },
  };

  let mut edges: Vec<usize> = ready.edges.clone();
  edges.sort_by_key(|idx| graph.edge(*idx).priority);
  for idx in edges {
    expr::apply_mappings(&snapshot, &graph.edge(idx).data_mapping, &mut input)?;
  }
  Ok(input)
}

/// Run a future, turning a panic into a node error tagged with `key`.
pub(crate) async fn guarded<K, T>(
  key: K,
  fut: impl Future<Output = T>,
) -> (K, Result<T, NodeExecutionError>) {
  match AssertUnwindSafe(fut).catch_unwind().await {
    Ok(value) => (key, Ok(value)),
    Err(panic) => {
      let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
      (
        key,
        Err(NodeExecutionError::internal(format!(
          "node task panicked: {message}"
        ))),
      )
    }
  }
}

/// Output of a finished scope.
///
/// With `use_output_vars`, output-scoped variables with a source path form
/// the result. Otherwise the single completed sink's output is returned, or
/// an object keyed by sink id when there are several.
pub(crate) fn scope_output(workflow: &Workflow, state: &ScopeState, use_output_vars: bool) -> Value {
  if use_output_vars {
    let declared: Vec<_> = workflow
      .def()
      .variables
      .iter()
      .filter(|v| v.scope == VariableScope::Output)
      .collect();
    if !declared.is_empty() {
      let snapshot = state.context.snapshot();
      let output: Map<String, Value> = declared
        .into_iter()
        .map(|var| {
          let value = var
            .source
            .as_deref()
            .and_then(|source| {
              if source.contains("${") {
                expr::interpolate(&snapshot, source).ok()
              } else {
                expr::resolve_path(&snapshot, source)
              }
            })
            .or_else(|| var.default.clone())
            .unwrap_or(Value::Null);
          (var.name.clone(), value)
        })
        .collect();
      return Value::Object(output);
    }
  }

  let sinks: Vec<&str> = workflow
    .sinks(&state.members)
    .into_iter()
    .filter(|id| state.scheduler.node_state(id) == Some(NodeState::Completed))
    .collect();
  match sinks.as_slice() {
    [] => Value::Null,
    [single] => state.context.output(single).cloned().unwrap_or(Value::Null),
    many => Value::Object(
      many
        .iter()
        .map(|id| {
          let output = state.context.output(id).cloned().unwrap_or(Value::Null);
          (id.to_string(), output)
        })
        .collect::<Map<String, Value>>(),
    ),
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;

  /// A top-level scope over `def` with default limits.
  pub(crate) fn scope(def: serde_json::Value, collaborators: Collaborators) -> RunScope {
    let def: WorkflowDef = serde_json::from_value(def).unwrap();
    let workflow = Arc::new(Workflow::from_def(def).unwrap());
    let settings = workflow.settings().clone();
    RunScope {
      engine: Engine::new(EngineConfig::default(), collaborators),
      policy: Arc::new(ErrorPolicy::new(workflow.def(), settings.continue_on_error)),
      budget: Arc::new(BudgetTracker::new(BudgetLimits::from_settings(&settings))),
      slots: Arc::new(Semaphore::new(settings.max_parallel_executions.max(1))),
      settings: Arc::new(settings),
      workflow,
      execution_id: "exec-test".to_string(),
      cancel: CancellationToken::new(),
      depth: 0,
      label: String::new(),
      timeout_override_ms: None,
    }
  }
}
