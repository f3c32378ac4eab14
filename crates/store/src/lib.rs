//! Persistence layer: the Primitive Store (read-mostly catalog of
//! providers, agents, tools, workflows, and WASM modules) and the Job
//! Store (the mutable job/job-step state machine), each with an
//! in-memory and a `SQLite` implementation.
//!
//! Both stores enforce the state machine from `loom_core::model`
//! server-side: a transition an implementation is asked to make that
//! `JobStatus::can_transition_to` rejects must come back as
//! [`error::StoreError::InvalidTransition`], never be applied silently.

pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::{StoreError, StoreResult};

use async_trait::async_trait;
use loom_core::model::{Agent, Job, JobStep, Provider, Tool, WasmModule, Workflow, WorkflowStep};
use uuid::Uuid;

/// Read-mostly access to the catalog entities configured ahead of time
/// (providers, agents, tools, workflows, WASM modules, settings).
#[async_trait]
pub trait PrimitiveStore: Send + Sync {
    async fn get_provider(&self, id: Uuid) -> StoreResult<Provider>;
    async fn get_agent(&self, id: Uuid) -> StoreResult<Agent>;
    async fn list_agents(&self) -> StoreResult<Vec<Agent>>;
    async fn get_agent_tools(&self, agent_id: Uuid) -> StoreResult<Vec<Tool>>;
    async fn get_tool(&self, id: Uuid) -> StoreResult<Tool>;
    async fn get_workflow(&self, id: Uuid) -> StoreResult<Workflow>;
    async fn list_workflows(&self) -> StoreResult<Vec<Workflow>>;
    async fn list_workflow_steps(&self, workflow_id: Uuid) -> StoreResult<Vec<WorkflowStep>>;
    async fn get_wasm_module(&self, id: Uuid) -> StoreResult<WasmModule>;
    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>>;
}

/// Mutable job/job-step state, including the queue-pickup operation the
/// scheduler polls.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: Job) -> StoreResult<Job>;
    async fn get_job(&self, id: Uuid) -> StoreResult<Job>;
    async fn update_job(&self, job: Job) -> StoreResult<Job>;

    /// Peek at the oldest queued job without claiming it. Returns
    /// `Ok(None)` if no job is queued. The caller claims the job by
    /// calling `mark_job_running`, whose own `Job::transition` check
    /// makes concurrent claims of the same id race-safe: the loser's
    /// transition fails against the already-flipped status and it
    /// silently moves on.
    async fn get_next_queued_job(&self) -> StoreResult<Option<Job>>;

    async fn mark_job_running(&self, id: Uuid) -> StoreResult<Job>;
    async fn mark_job_completed(&self, id: Uuid, output: serde_json::Value) -> StoreResult<Job>;
    async fn mark_job_failed(&self, id: Uuid, error: String) -> StoreResult<Job>;
    async fn cancel_job(&self, id: Uuid) -> StoreResult<Job>;

    async fn create_job_step(&self, step: JobStep) -> StoreResult<JobStep>;
    async fn get_job_step(&self, id: Uuid) -> StoreResult<JobStep>;
    async fn list_job_steps(&self, job_id: Uuid) -> StoreResult<Vec<JobStep>>;
    async fn mark_job_step_running(&self, id: Uuid) -> StoreResult<JobStep>;
    async fn mark_job_step_completed(
        &self,
        id: Uuid,
        output: serde_json::Value,
    ) -> StoreResult<JobStep>;
    async fn mark_job_step_failed(&self, id: Uuid, error: String) -> StoreResult<JobStep>;
}
