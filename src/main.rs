use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kestrel_config::{FailureStrategy, MasterConfig, RunMode, WorkflowDef};
use kestrel_engine::EngineBuilder;
use kestrel_store::{MemoryStore, Store, WorkflowState};
use kestrel_task::{LocalWorker, PluginRegistry, ShellTaskFactory, task_event_channel};
use kestrel_workflow::Workflow;

/// Kestrel - run DAG workflows with a single in-process master
#[derive(Parser)]
#[command(name = "kestrel")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Master settings (JSON); defaults apply to missing fields
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a workflow to completion and print its task instances
  Run {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,

    /// Trigger parameters as a JSON object; read from stdin when omitted
    #[arg(long)]
    params: Option<String>,

    #[arg(long, value_enum, default_value_t = Strategy::Continue)]
    failure_strategy: Strategy,
  },

  /// Check a workflow file without running it
  Validate {
    /// Path to the workflow file (JSON)
    workflow_file: PathBuf,
  },
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
  End,
  Continue,
}

impl From<Strategy> for FailureStrategy {
  fn from(strategy: Strategy) -> Self {
    match strategy {
      Strategy::End => FailureStrategy::EndOnFailure,
      Strategy::Continue => FailureStrategy::ContinueOnFailure,
    }
  }
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let config = match &cli.config {
    Some(path) => MasterConfig::load(path)
      .with_context(|| format!("failed to load config: {}", path.display()))?,
    None => MasterConfig::default(),
  };

  match cli.command {
    Some(Commands::Run {
      workflow_file,
      params,
      failure_strategy,
    }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run_workflow(
        config,
        workflow_file,
        params,
        failure_strategy.into(),
      ))?;
    }
    Some(Commands::Validate { workflow_file }) => {
      validate_workflow(workflow_file)?;
    }
    None => {
      println!("kestrel - use --help to see available commands");
    }
  }

  Ok(())
}

fn read_workflow(workflow_file: &Path) -> Result<WorkflowDef> {
  let content = std::fs::read_to_string(workflow_file)
    .with_context(|| format!("failed to read workflow file: {}", workflow_file.display()))?;
  WorkflowDef::from_json(&content)
    .with_context(|| format!("failed to parse workflow file: {}", workflow_file.display()))
}

fn validate_workflow(workflow_file: PathBuf) -> Result<()> {
  let def = read_workflow(&workflow_file)?;
  let workflow = Workflow::lock(def).context("invalid workflow")?;
  eprintln!(
    "Workflow '{}' is valid: {} nodes, {} edges",
    workflow.workflow_id,
    workflow.nodes.len(),
    workflow.edges.len()
  );
  Ok(())
}

async fn run_workflow(
  config: MasterConfig,
  workflow_file: PathBuf,
  params: Option<String>,
  failure_strategy: FailureStrategy,
) -> Result<()> {
  let def = read_workflow(&workflow_file)?;
  eprintln!("Loaded workflow: {}", def.name);

  let params = match params {
    Some(json) => parse_params(&json).context("failed to parse --params")?,
    None => read_params_from_stdin()?,
  };

  let store = Arc::new(MemoryStore::new());
  let (events_tx, events_rx) = task_event_channel(config.event_buffer_size);
  let plugins = PluginRegistry::new().with(Arc::new(ShellTaskFactory));
  let worker = Arc::new(LocalWorker::new(plugins, events_tx));
  let engine = EngineBuilder::new(config, store.clone(), worker)
    .build(events_rx)
    .context("failed to create workflow engine")?;

  let instance_id = engine
    .create(def, params, failure_strategy, RunMode::Serial)
    .await
    .context("failed to start workflow")?;
  let state = engine
    .wait(&instance_id)
    .await
    .context("workflow execution failed")?;
  info!(instance_id = %instance_id, state = %state, "workflow_completed");

  let instance = store.get_instance(&instance_id).await?;
  let tasks = store.list_task_instances(&instance_id).await?;
  let output = serde_json::json!({
    "instance_id": instance_id,
    "state": state,
    "variables": instance.var_pool,
    "tasks": tasks,
  });
  println!("{}", serde_json::to_string_pretty(&output)?);

  if state != WorkflowState::Success {
    bail!("workflow finished in {state}");
  }
  Ok(())
}

fn parse_params(json: &str) -> Result<HashMap<String, serde_json::Value>> {
  if json.trim().is_empty() {
    return Ok(HashMap::new());
  }
  Ok(serde_json::from_str(json)?)
}

fn read_params_from_stdin() -> Result<HashMap<String, serde_json::Value>> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(HashMap::new());
  }
  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read params from stdin")?;
  parse_params(&input).context("failed to parse params JSON from stdin")
}
