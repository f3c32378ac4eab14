//! The Scheduler/Engine: a single poller task feeding a bounded channel
//! of job ids, drained by `N` worker tasks. Grounded in the teacher's
//! `ResearchPool` (`worker_count` config, one channel, `worker_count`
//! spawned tasks each running a `worker_loop`), adapted from its
//! `crossbeam_channel` + blocking-recv shape to an async
//! `tokio::sync::mpsc` channel since every store/executor call here is
//! itself async.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use loom_agent::AgentRuntime;
use loom_core::carry;
use loom_core::model::{Job, JobStatus, SettingKey, StepType, WorkflowStep};
use loom_store::{JobStore, PrimitiveStore};
use loom_wasm::WasmExecutor;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::metrics;

struct RunningHandles {
    poller: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Owns the worker pool. `Start`/`Stop` are idempotent-guarded by
/// `running`; `SubmitJob`/`SubmitJobWithWorkingDir` only ever touch the
/// Job Store, never the channel directly — the poller is the sole
/// channel producer, matching the documented backpressure model.
pub struct Engine {
    config: EngineConfig,
    job_store: Arc<dyn JobStore>,
    primitive_store: Arc<dyn PrimitiveStore>,
    agent_runtime: Arc<AgentRuntime>,
    wasm_executor: Arc<WasmExecutor>,
    running: AtomicBool,
    handles: Mutex<Option<RunningHandles>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl Engine {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        job_store: Arc<dyn JobStore>,
        primitive_store: Arc<dyn PrimitiveStore>,
        agent_runtime: Arc<AgentRuntime>,
        wasm_executor: Arc<WasmExecutor>,
    ) -> Self {
        Self {
            config,
            job_store,
            primitive_store,
            agent_runtime,
            wasm_executor,
            running: AtomicBool::new(false),
            handles: Mutex::new(None),
        }
    }

    /// Spawn the poller and `worker_count` workers. Fails if already
    /// running.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Validation("engine is already running".to_string()));
        }

        let (job_tx, job_rx) = mpsc::channel::<Uuid>(self.config.max_queue_size);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let poller_engine = Arc::clone(self);
        let poller = tokio::spawn(async move { poller_engine.run_poller(job_tx).await });

        let mut workers = Vec::with_capacity(self.config.worker_count);
        for worker_id in 0..self.config.worker_count {
            let worker_engine = Arc::clone(self);
            let worker_rx = Arc::clone(&job_rx);
            workers.push(tokio::spawn(async move {
                worker_engine.run_worker(worker_id, worker_rx).await;
            }));
        }

        *self.handles.lock().await = Some(RunningHandles { poller, workers });
        info!(workers = self.config.worker_count, "engine started");
        Ok(())
    }

    /// Cooperative shutdown: flips `running` off (both loops check it
    /// every tick) and waits for every task to return.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handles) = self.handles.lock().await.take() {
            let _ = handles.poller.await;
            for worker in handles.workers {
                let _ = worker.await;
            }
        }
        info!("engine stopped");
    }

    pub async fn submit_job(&self, workflow_id: Uuid, input: serde_json::Value) -> EngineResult<Job> {
        let job = Job::new(Some(workflow_id), None, input, None);
        Ok(self.job_store.create_job(job).await?)
    }

    pub async fn submit_job_with_working_dir(
        &self,
        workflow_id: Uuid,
        input: serde_json::Value,
        working_dir: String,
    ) -> EngineResult<Job> {
        let job = Job::new(Some(workflow_id), None, input, Some(working_dir));
        Ok(self.job_store.create_job(job).await?)
    }

    pub async fn get_job(&self, id: Uuid) -> EngineResult<Job> {
        Ok(self.job_store.get_job(id).await?)
    }

    pub async fn cancel_job(&self, id: Uuid) -> EngineResult<Job> {
        Ok(self.job_store.cancel_job(id).await?)
    }

    async fn run_poller(&self, job_tx: mpsc::Sender<Uuid>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            interval.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            metrics::set_queue_depth((self.config.max_queue_size - job_tx.capacity()) as f64);

            match self.job_store.get_next_queued_job().await {
                Ok(Some(job)) => match job_tx.try_send(job.id) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("worker channel full, will retry next tick");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                },
                Ok(None) => {}
                Err(e) => error!(error = %e, "poller failed to read next queued job"),
            }
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, job_rx: Arc<Mutex<mpsc::Receiver<Uuid>>>) {
        info!(worker_id, "worker started");
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let next = { job_rx.lock().await.recv().await };
            let Some(job_id) = next else {
                break;
            };

            metrics::inc_active_workers();
            let started = Instant::now();
            let outcome = std::panic::AssertUnwindSafe(self.process_job(job_id)).catch_unwind().await;
            metrics::dec_active_workers();

            let status_label = match &outcome {
                Ok(Ok(())) => "completed",
                Ok(Err(EngineError::Cancelled(_))) => "cancelled",
                Ok(Err(EngineError::Deadline(_))) => "timeout",
                Ok(Err(e)) => {
                    error!(worker_id, %job_id, error = %e, "job processing failed");
                    "failed"
                }
                Err(panic) => {
                    error!(worker_id, %job_id, panic = ?panic, "worker panicked processing job; continuing");
                    "panicked"
                }
            };
            metrics::record_job_terminal(status_label, started.elapsed().as_secs_f64());
        }
        info!(worker_id, "worker stopped");
    }

    /// `ProcessJob`: steps 1-5 of the documented algorithm.
    async fn process_job(&self, job_id: Uuid) -> EngineResult<()> {
        let mut job = self.job_store.get_job(job_id).await?;
        if job.status != JobStatus::Queued {
            return Ok(());
        }
        if self.job_store.mark_job_running(job_id).await.is_err() {
            return Ok(());
        }
        job.status = JobStatus::Running;

        let Some(workflow_id) = job.workflow_id else {
            let msg = "job has no workflow_id".to_string();
            self.job_store.mark_job_failed(job_id, msg.clone()).await?;
            return Err(EngineError::Validation(msg));
        };

        let steps = match self.primitive_store.list_workflow_steps(workflow_id).await {
            Ok(steps) => steps,
            Err(e) => {
                self.job_store.mark_job_failed(job_id, e.to_string()).await?;
                return Err(e.into());
            }
        };

        let timeout_job_seconds = match self.primitive_store.get_setting(SettingKey::TimeoutJobSeconds.as_str()).await {
            Ok(raw) => loom_core::model::parse_timeout_setting(SettingKey::TimeoutJobSeconds, raw.as_deref())
                .unwrap_or_else(|_| SettingKey::TimeoutJobSeconds.default_value()),
            Err(_) => SettingKey::TimeoutJobSeconds.default_value(),
        };
        let deadline = Instant::now() + Duration::from_secs(timeout_job_seconds);

        let mut carry = job.input_data.clone();
        let mut working_dir = job.working_dir.clone();

        for step in steps {
            if Instant::now() >= deadline {
                self.job_store.mark_job_failed(job_id, "job timed out".to_string()).await?;
                return Err(EngineError::Deadline(job_id));
            }

            match self.job_store.get_job(job_id).await {
                Ok(refreshed) if refreshed.status == JobStatus::Cancelled => {
                    return Err(EngineError::Cancelled(job_id));
                }
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }

            let step_input = carry::build_step_input(&step.config, &carry);
            let job_step = self
                .job_store
                .create_job_step(loom_core::model::JobStep::queued(job_id, step.id, step.step_order, step_input.clone()))
                .await?;
            self.job_store.mark_job_step_running(job_step.id).await?;

            let step_type_label = match step.step_type {
                StepType::Agent => "agent",
                StepType::WasmModule => "wasm_module",
            };

            let result = self.run_step(job_id, &mut working_dir, &step, step_input, deadline).await;

            match result {
                Ok(output) => {
                    self.job_store.mark_job_step_completed(job_step.id, output.clone()).await?;
                    metrics::record_job_step(step_type_label, "completed");
                    carry = output;
                }
                Err(e) => {
                    self.job_store.mark_job_step_failed(job_step.id, e.to_string()).await?;
                    metrics::record_job_step(step_type_label, "failed");
                    self.job_store.mark_job_failed(job_id, e.to_string()).await?;
                    return Err(e);
                }
            }
        }

        if working_dir != job.working_dir {
            job.working_dir = working_dir;
            let _ = self.job_store.update_job(job.clone()).await;
        }

        self.job_store.mark_job_completed(job_id, carry).await?;
        Ok(())
    }

    /// Dispatches to the step's executor. `working_dir` is threaded by
    /// reference so a WASM step's `set_working_directory` call takes
    /// effect for every later step of the same job.
    async fn run_step(
        &self,
        job_id: Uuid,
        working_dir: &mut Option<String>,
        step: &WorkflowStep,
        carry_in: serde_json::Value,
        deadline: Instant,
    ) -> EngineResult<serde_json::Value> {
        match step.step_type {
            StepType::Agent => self.process_agent_step(job_id, step, carry_in).await,
            StepType::WasmModule => self.process_wasm_step(job_id, working_dir, step, carry_in, deadline).await,
        }
    }

    /// Agent-step adapter: single-message prompt from `carry`, wrapped
    /// back as `{"prompt": reply}` for downstream agent/WASM steps.
    async fn process_agent_step(&self, job_id: Uuid, step: &WorkflowStep, carry_in: serde_json::Value) -> EngineResult<serde_json::Value> {
        let agent_id = step
            .agent_id
            .ok_or_else(|| EngineError::Validation(format!("step {} is step_type=agent but has no agent_id", step.id)))?;
        let prompt = carry::unwrap_prompt(&carry_in);

        let completion = self.agent_runtime.execute_agent_by_id(job_id, agent_id, prompt).await?;
        let reply_text = completion
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(carry::wrap_prompt(reply_text))
    }

    /// WASM-step adapter: re-wraps a structured `output` field as
    /// `{"prompt": output}` for downstream agent steps; otherwise
    /// passes the whole result through. A module that calls
    /// `set_working_directory` changes `working_dir` in place, so later
    /// steps of the same job see it.
    async fn process_wasm_step(
        &self,
        job_id: Uuid,
        working_dir: &mut Option<String>,
        step: &WorkflowStep,
        carry_in: serde_json::Value,
        deadline: Instant,
    ) -> EngineResult<serde_json::Value> {
        let module_id = step
            .wasm_module_id
            .ok_or_else(|| EngineError::Validation(format!("step {} is step_type=wasm_module but has no wasm_module_id", step.id)))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(EngineError::Deadline(job_id));
        }

        let module = self.primitive_store.get_wasm_module(module_id).await?;
        let result = self
            .wasm_executor
            .execute(
                module_id,
                &module.module_bytes,
                module.config.clone(),
                carry_in,
                working_dir.clone(),
                remaining,
            )
            .await?;

        if !result.success {
            return Err(EngineError::Validation(result.message));
        }

        if let Some(new_dir) = result.new_working_directory {
            *working_dir = Some(new_dir);
        }

        Ok(carry::next_carry(&serde_json::json!({"output": result.output})))
    }
}
