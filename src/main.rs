use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use switchyard_config::WorkflowDef;
use switchyard_engine::{
  AutoApprove, Collaborators, EchoAgent, Engine, EngineConfig, ExecutionRecord, ExecutionStatus,
  RunOverrides,
};
use switchyard_store::{FileCheckpointStore, FileKvStore};

/// Switchyard - a workflow execution engine for agent pipelines
///
/// The command line runs workflows against local collaborators only: agent
/// nodes echo their input back as output, and every human-in-the-loop gate
/// is answered at once with the `--decision` option. Embed the engine as a
/// library to plug in real agents and approval channels.
#[derive(Parser)]
#[command(name = "switchyard")]
#[command(version, about)]
struct Cli {
  /// Path to the data directory (default: ~/.switchyard)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Directory for checkpoints (default: <data-dir>/checkpoints)
  #[arg(long, global = true)]
  checkpoint_dir: Option<PathBuf>,

  /// Option used to answer every human-in-the-loop gate
  #[arg(long, global = true, default_value = "approve")]
  decision: String,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a workflow, reading the input payload from stdin
  ///
  /// Agent nodes echo their input; human gates get the `--decision` answer.
  Run {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,

    /// JSON file with run overrides
    #[arg(long)]
    overrides: Option<PathBuf>,
  },

  /// Check a workflow definition and, when piped, an input payload
  Validate {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,
  },

  /// Resume an execution from its latest checkpoint
  Resume {
    /// Path to the workflow file the execution was started with
    workflow_file: PathBuf,

    /// The execution to resume
    #[arg(long)]
    execution_id: String,

    /// Require the latest checkpoint to have this id
    #[arg(long)]
    checkpoint_id: Option<String>,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".switchyard"),
  };
  let checkpoint_dir = cli
    .checkpoint_dir
    .unwrap_or_else(|| data_dir.join("checkpoints"));

  match cli.command {
    Some(Commands::Run {
      workflow_file,
      overrides,
    }) => {
      let rt = tokio::runtime::Runtime::new()?;
      let engine = create_engine(&data_dir, &checkpoint_dir, &cli.decision)?;
      let record = rt.block_on(run_workflow(&engine, &workflow_file, overrides.as_deref()))?;
      finish(&record)?;
    }
    Some(Commands::Validate { workflow_file }) => {
      validate_workflow(&workflow_file)?;
    }
    Some(Commands::Resume {
      workflow_file,
      execution_id,
      checkpoint_id,
    }) => {
      let rt = tokio::runtime::Runtime::new()?;
      let engine = create_engine(&data_dir, &checkpoint_dir, &cli.decision)?;
      let record = rt.block_on(resume_workflow(
        &engine,
        &workflow_file,
        &execution_id,
        checkpoint_id.as_deref(),
      ))?;
      finish(&record)?;
    }
    None => {
      println!("switchyard - use --help to see available commands");
    }
  }

  Ok(())
}

async fn run_workflow(
  engine: &Engine,
  workflow_file: &Path,
  overrides_file: Option<&Path>,
) -> Result<ExecutionRecord> {
  let workflow_def = read_workflow(workflow_file)?;
  let overrides = match overrides_file {
    Some(path) => {
      let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read overrides file: {}", path.display()))?;
      serde_json::from_str(&content)
        .with_context(|| format!("failed to parse overrides file: {}", path.display()))?
    }
    None => RunOverrides::default(),
  };
  let payload = read_payload_from_stdin()?;

  info!(workflow = %workflow_def.name, "loaded workflow");
  let record = engine
    .execute(workflow_def, payload, overrides, interrupt_token())
    .await
    .context("workflow could not be started")?;
  Ok(record)
}

async fn resume_workflow(
  engine: &Engine,
  workflow_file: &Path,
  execution_id: &str,
  checkpoint_id: Option<&str>,
) -> Result<ExecutionRecord> {
  let workflow_def = read_workflow(workflow_file)?;
  let record = engine
    .resume(workflow_def, execution_id, checkpoint_id, interrupt_token())
    .await
    .with_context(|| format!("failed to resume execution {execution_id}"))?;
  Ok(record)
}

fn validate_workflow(workflow_file: &Path) -> Result<()> {
  let workflow_def = read_workflow(workflow_file)?;
  let name = workflow_def.name.clone();
  let node_count = workflow_def.nodes.len();
  let payload = read_payload_from_stdin()?;

  let engine = Engine::new(EngineConfig::default(), Collaborators::default());
  engine
    .prepare(workflow_def, payload, &RunOverrides::default())
    .context("workflow is invalid")?;

  eprintln!("Workflow '{name}' is valid ({node_count} nodes)");
  Ok(())
}

/// Engine with file-backed storage and checkpoints under the data directory,
/// an echoing agent and a fixed approval answer.
fn create_engine(data_dir: &Path, checkpoint_dir: &Path, decision: &str) -> Result<Engine> {
  let storage_dir = data_dir.join("storage");
  let storage = FileKvStore::new(&storage_dir)
    .with_context(|| format!("failed to open storage at {}", storage_dir.display()))?;
  let checkpoints = FileCheckpointStore::new(checkpoint_dir)
    .with_context(|| format!("failed to open checkpoints at {}", checkpoint_dir.display()))?;

  Ok(Engine::new(
    EngineConfig::default(),
    Collaborators {
      agents: Arc::new(EchoAgent),
      approvals: Arc::new(AutoApprove::new(decision)),
      storage: Arc::new(storage),
      checkpoints: Arc::new(checkpoints),
      ..Default::default()
    },
  ))
}

/// Cancelled on Ctrl-C so the run is finalized as cancelled.
fn interrupt_token() -> CancellationToken {
  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      trigger.cancel();
    }
  });
  cancel
}

/// Print the record as JSON and fail the process unless the run completed.
fn finish(record: &ExecutionRecord) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(record)?);
  eprintln!("Execution {}: {:?}", record.execution_id, record.status);

  match record.status {
    ExecutionStatus::Completed => Ok(()),
    status => match &record.error {
      Some(failure) => bail!("execution {status:?}: {}", failure.error),
      None => bail!("execution {status:?}"),
    },
  }
}

fn read_workflow(workflow_file: &Path) -> Result<WorkflowDef> {
  let content = std::fs::read_to_string(workflow_file)
    .with_context(|| format!("failed to read workflow file: {}", workflow_file.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse workflow file: {}", workflow_file.display()))
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, use empty object
    return Ok(serde_json::json!({}));
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read payload from stdin")?;

  if input.trim().is_empty() {
    Ok(serde_json::json!({}))
  } else {
    serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_decision_defaults_to_approve() {
    let cli = Cli::try_parse_from(["switchyard", "run", "flow.json"]).unwrap();
    assert_eq!(cli.decision, "approve");
    assert!(matches!(cli.command, Some(Commands::Run { .. })));
  }

  #[test]
  fn test_decision_is_global() {
    let cli = Cli::try_parse_from([
      "switchyard",
      "resume",
      "flow.json",
      "--execution-id",
      "exec-1",
      "--decision",
      "reject",
    ])
    .unwrap();
    assert_eq!(cli.decision, "reject");
  }
}
