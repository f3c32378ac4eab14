//! `loom` — a minimal, non-HTTP command-line surface for the job
//! scheduler. Grounded in the teacher's `shannon-api` binary entry point
//! (clap-derived args, `EnvFilter`-based tracing init) but without the
//! REST surface: this binary only submits and inspects jobs and runs
//! the worker pool in the foreground, which is enough to prove the
//! submission routing and scheduler end to end.

mod config;
mod demo;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loom_agent::runtime::WorkflowSubmitter;
use loom_agent::AgentRuntime;
use loom_engine::{Engine, EngineConfig, EngineExecutionHost, EngineWorkflowSubmitter};
use loom_store::sqlite::{SqliteHandle, SqliteJobStore, SqlitePrimitiveStore};
use loom_store::{JobStore, PrimitiveStore};
use loom_wasm::{WasmExecutor, WasmExecutorConfig};
use uuid::Uuid;

use crate::config::{init_tracing, LogFormat};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "loom", about = "Agent/workflow job scheduler — local CLI", version)]
struct Args {
    /// Path to the `SQLite` catalog/job database. Shared across
    /// invocations so `submit` and `status` in separate processes see
    /// the same jobs.
    #[arg(long, env = "LOOM_STORE_PATH", default_value = "loom.db")]
    store_path: String,

    /// `human` (default) or `json` log output. Overridden by
    /// `LOOM_LOG_FORMAT` if set.
    #[arg(long, env = "LOOM_LOG_FORMAT", default_value = "human")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seed the catalog with a single provider/agent/workflow so
    /// `submit` has something to run against.
    InitDemo,
    /// Submit a job against a workflow by name or id.
    Submit {
        /// Workflow name (case-insensitive) or UUID.
        workflow: String,
        /// JSON input for the job's first step. Defaults to `{}`.
        #[arg(long, default_value = "{}")]
        input: String,
        /// Initial working directory granted to WASM/filesystem steps.
        #[arg(long)]
        working_dir: Option<String>,
        /// Block until the job reaches a terminal state instead of
        /// returning immediately.
        #[arg(long)]
        wait: bool,
    },
    /// Print a job's current status and output.
    Status {
        /// Job id, as printed by `submit`.
        job_id: Uuid,
    },
    /// Run the scheduler's poller and worker pool in the foreground
    /// until interrupted.
    Worker {
        #[arg(long, default_value_t = EngineConfig::default().worker_count)]
        workers: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);
    loom_engine::metrics::init_metrics().context("failed to initialize metrics registry")?;

    let handle = SqliteHandle::open(args.store_path.clone())
        .await
        .context("failed to open store")?;
    let primitive_store: Arc<dyn PrimitiveStore> = Arc::new(SqlitePrimitiveStore::new(handle.clone()));
    let job_store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(handle.clone()));

    match args.command {
        Command::InitDemo => {
            demo::seed(&handle).await?;
            tracing::info!("demo catalog seeded into {}", args.store_path);
        }
        Command::Submit {
            workflow,
            input,
            working_dir,
            wait,
        } => {
            let input: serde_json::Value = serde_json::from_str(&input).context("--input is not valid JSON")?;
            let submitter = EngineWorkflowSubmitter::new(
                Arc::clone(&job_store),
                Arc::clone(&primitive_store),
                EngineConfig::default().waiter_poll_interval,
            );
            let job = if wait {
                submitter.submit_and_wait(&workflow, input).await?
            } else {
                submitter.submit(&workflow, input).await?
            };
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Status { job_id } => {
            let job = job_store.get_job(job_id).await.context("job not found")?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Worker { workers } => {
            let mut engine_config = EngineConfig::default();
            engine_config.worker_count = workers;

            let llm = loom_agent::llm_client::LlmClient::new(Duration::from_secs(60)).context("failed to build LLM client")?;
            let submitter: Arc<dyn WorkflowSubmitter> = Arc::new(EngineWorkflowSubmitter::new(
                Arc::clone(&job_store),
                Arc::clone(&primitive_store),
                engine_config.waiter_poll_interval,
            ));
            let agent_runtime = Arc::new(AgentRuntime::new(Arc::clone(&primitive_store), llm, submitter));

            let execution_host = Arc::new(EngineExecutionHost::new(
                Arc::clone(&job_store),
                Arc::clone(&primitive_store),
                Arc::clone(&agent_runtime),
            ));
            let wasm_executor = Arc::new(WasmExecutor::new(WasmExecutorConfig::default(), execution_host).context("failed to build WASM executor")?);

            let engine = Arc::new(Engine::new(
                engine_config,
                Arc::clone(&job_store),
                Arc::clone(&primitive_store),
                agent_runtime,
                wasm_executor,
            ));

            engine.start().await.context("failed to start engine")?;
            tracing::info!("worker pool running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            engine.stop().await;
        }
    }

    Ok(())
}
