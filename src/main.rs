use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sluice_cache::{DatasetRegistry, ResultCache};
use sluice_config::{SchedulerKind, SluiceConfig};
use sluice_container::{ContainerRunner, ContainerTask};
use sluice_fleet::{Backends, ContainerBackend, Manager, RunRequest, SchedulerBackend};
use sluice_pipeline::Pipeline;
use sluice_scheduler::{BatchScheduler, JobHandle, SlurmScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Sluice - a scheduling engine for reproducible containerised pipelines
#[derive(Parser)]
#[command(name = "sluice")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Directory for sandboxes (default: SLUICE_SANDBOX_ROOT or the local data dir)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a pipeline to completion and print its summary as JSON
  Run {
    /// Path to the pipeline definition (JSON)
    pipeline_file: PathBuf,

    /// Input files, in pipeline input order
    #[arg(long = "input", required = true)]
    inputs: Vec<PathBuf>,

    /// Number of worker slots
    #[arg(long)]
    workers: Option<usize>,

    /// Batch scheduler for tasks: none, local or slurm
    #[arg(long)]
    scheduler: Option<SchedulerKind>,

    /// Priority passed to the batch scheduler
    #[arg(long, default_value_t = 0)]
    priority: u32,

    /// User id batch jobs run as
    #[arg(long, requires = "gid")]
    uid: Option<u32>,

    /// Group id batch jobs run as
    #[arg(long, requires = "uid")]
    gid: Option<u32>,
  },

  /// Run one container task in place (used as the batch job)
  ExecTask {
    /// Path to task.json inside the sandbox
    task_file: PathBuf,
  },

  /// Print Slurm accounting records for jobs
  Accounting {
    /// Job ids
    #[arg(required = true)]
    jobs: Vec<String>,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(EnvFilter::from_default_env())
    .init();

  let cli = Cli::parse();
  let mut config = SluiceConfig::from_env().context("invalid SLUICE_* configuration")?;
  if let Some(data_dir) = cli.data_dir {
    config.fleet.sandbox_root = data_dir.join("sandboxes");
  }

  match cli.command {
    Some(Commands::Run {
      pipeline_file,
      inputs,
      workers,
      scheduler,
      priority,
      uid,
      gid,
    }) => {
      if let Some(workers) = workers {
        config.fleet.worker_count = workers.max(1);
      }
      if let Some(kind) = scheduler {
        config.scheduler.kind = kind;
      }
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run_pipeline(config, pipeline_file, inputs, priority, uid.zip(gid)))
    }
    Some(Commands::ExecTask { task_file }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(exec_task(config, task_file))
    }
    Some(Commands::Accounting { jobs }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(accounting(config, jobs))
    }
    None => {
      println!("sluice - use --help to see available commands");
      Ok(())
    }
  }
}

async fn run_pipeline(
  config: SluiceConfig,
  pipeline_file: PathBuf,
  inputs: Vec<PathBuf>,
  priority: u32,
  owner: Option<(u32, u32)>,
) -> Result<()> {
  let pipeline = Pipeline::from_path(&pipeline_file)
    .with_context(|| format!("failed to load pipeline: {}", pipeline_file.display()))?;
  eprintln!("Loaded pipeline: {} ({} steps)", pipeline.name, pipeline.steps.len());

  let runner = ContainerRunner::new(config.container.clone());
  let mut backends = Backends::local(Arc::new(ContainerBackend::new(runner)));
  if let Some(scheduler) = sluice_scheduler::from_config(&config.scheduler, config.fleet.worker_count) {
    let helper = match &config.scheduler.helper_program {
      Some(helper) => helper.clone(),
      None => std::env::current_exe().context("failed to locate the sluice executable")?,
    };
    backends = backends.with_cluster(Arc::new(SchedulerBackend::new(
      scheduler,
      helper,
      config.fleet.job_poll_interval(),
    )));
  }

  let manager = Manager::new(
    config.fleet.clone(),
    backends,
    ResultCache::new(),
    DatasetRegistry::new(),
  );
  let handle = manager.handle();
  let cancel = CancellationToken::new();
  let fleet = tokio::spawn(manager.start(cancel.clone()));

  let mut request = RunRequest::new(pipeline, inputs).with_priority(priority);
  if let Some((uid, gid)) = owner {
    request = request.with_owner(uid, gid);
  }
  let ticket = handle.submit_run(request).context("run rejected")?;
  let run_id = ticket.run_id();
  info!(run_id = %run_id, "run_submitted");

  let interrupt = handle.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!(run_id = %run_id, "interrupt_received");
      let _ = interrupt.cancel_run(run_id);
    }
  });

  let summary = tokio::select! {
    summary = ticket.wait() => summary.context("run did not finish")?,
    joined = fleet => {
      joined.context("manager task failed")?.context("manager stopped")?;
      bail!("manager stopped before run {} finished", run_id);
    }
  };
  cancel.cancel();

  println!("{}", serde_json::to_string_pretty(&summary)?);
  if !summary.is_success() {
    bail!("run {} finished {}", summary.run_id, summary.state);
  }
  Ok(())
}

async fn exec_task(config: SluiceConfig, task_file: PathBuf) -> Result<()> {
  let task = ContainerTask::read(&task_file)
    .with_context(|| format!("failed to read task: {}", task_file.display()))?;
  let root = task_file
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or(Path::new("."))
    .to_path_buf();

  let cancel = CancellationToken::new();
  let interrupt = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      interrupt.cancel();
    }
  });

  let outcome = ContainerRunner::new(config.container)
    .run(&task, &root, &cancel)
    .await
    .with_context(|| format!("task {} could not run", task.task_id))?;
  eprintln!("Task {} finished: {}", outcome.task_id, outcome.kind);

  if !outcome.kind.is_success() {
    bail!("task {} finished {}", outcome.task_id, outcome.kind);
  }
  Ok(())
}

async fn accounting(config: SluiceConfig, jobs: Vec<String>) -> Result<()> {
  let slurm = SlurmScheduler::new(config.scheduler);
  let handles: Vec<JobHandle> = jobs.into_iter().map(JobHandle::new).collect();
  let mut records = slurm
    .accounting(&handles)
    .await
    .context("failed to query accounting")?;

  let ordered: Vec<_> = handles.iter().filter_map(|h| records.remove(h)).collect();
  println!("{}", serde_json::to_string_pretty(&ordered)?);
  Ok(())
}
