//! In-memory `PrimitiveStore`/`JobStore` implementation, used by unit
//! tests and `loom-cli`'s default local mode.

use std::collections::HashMap;

use async_trait::async_trait;
use loom_core::model::{
    Agent, AgentTool, Job, JobStatus, JobStep, Provider, Tool, WasmModule, Workflow, WorkflowStep,
};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::{JobStore, PrimitiveStore};

/// All catalog entities kept in memory. Seed with [`MemoryPrimitiveStore::seed_agent`]
/// and friends, or build directly with `Default` and populate via the
/// `pub(crate)`-free field accessors below.
#[derive(Debug, Default)]
pub struct MemoryPrimitiveStore {
    providers: RwLock<HashMap<Uuid, Provider>>,
    agents: RwLock<HashMap<Uuid, Agent>>,
    agent_tools: RwLock<Vec<AgentTool>>,
    tools: RwLock<HashMap<Uuid, Tool>>,
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    workflow_steps: RwLock<HashMap<Uuid, Vec<WorkflowStep>>>,
    wasm_modules: RwLock<HashMap<Uuid, WasmModule>>,
    settings: RwLock<HashMap<String, String>>,
}

impl MemoryPrimitiveStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_provider(&self, provider: Provider) {
        self.providers.write().insert(provider.id, provider);
    }

    pub fn seed_agent(&self, agent: Agent) {
        self.agents.write().insert(agent.id, agent);
    }

    pub fn seed_tool(&self, tool: Tool) {
        self.tools.write().insert(tool.id, tool);
    }

    pub fn seed_agent_tool(&self, agent_id: Uuid, tool_id: Uuid) {
        self.agent_tools.write().push(AgentTool { agent_id, tool_id });
    }

    pub fn seed_workflow(&self, workflow: Workflow, steps: Vec<WorkflowStep>) {
        let id = workflow.id;
        self.workflows.write().insert(id, workflow);
        self.workflow_steps.write().insert(id, steps);
    }

    pub fn seed_wasm_module(&self, module: WasmModule) {
        self.wasm_modules.write().insert(module.id, module);
    }

    pub fn seed_setting(&self, key: impl Into<String>, value: impl Into<String>) {
        self.settings.write().insert(key.into(), value.into());
    }
}

#[async_trait]
impl PrimitiveStore for MemoryPrimitiveStore {
    async fn get_provider(&self, id: Uuid) -> StoreResult<Provider> {
        self.providers
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("provider", id))
    }

    async fn get_agent(&self, id: Uuid) -> StoreResult<Agent> {
        self.agents
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("agent", id))
    }

    async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        Ok(self.agents.read().values().cloned().collect())
    }

    async fn get_agent_tools(&self, agent_id: Uuid) -> StoreResult<Vec<Tool>> {
        let tool_ids: Vec<Uuid> = self
            .agent_tools
            .read()
            .iter()
            .filter(|rel| rel.agent_id == agent_id)
            .map(|rel| rel.tool_id)
            .collect();
        let tools = self.tools.read();
        Ok(tool_ids
            .into_iter()
            .filter_map(|id| tools.get(&id).cloned())
            .collect())
    }

    async fn get_tool(&self, id: Uuid) -> StoreResult<Tool> {
        self.tools
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("tool", id))
    }

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Workflow> {
        self.workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("workflow", id))
    }

    async fn list_workflows(&self) -> StoreResult<Vec<Workflow>> {
        Ok(self.workflows.read().values().cloned().collect())
    }

    async fn list_workflow_steps(&self, workflow_id: Uuid) -> StoreResult<Vec<WorkflowStep>> {
        let mut steps = self
            .workflow_steps
            .read()
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default();
        steps.sort_by_key(|s| s.step_order);
        Ok(steps)
    }

    async fn get_wasm_module(&self, id: Uuid) -> StoreResult<WasmModule> {
        self.wasm_modules
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("wasm_module", id))
    }

    async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.settings.read().get(key).cloned())
    }
}

/// In-memory job/job-step state machine store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    /// Insertion order, oldest first, to keep `get_next_queued_job` FIFO.
    job_order: RwLock<Vec<Uuid>>,
    job_steps: RwLock<HashMap<Uuid, JobStep>>,
}

impl MemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn transition_job(&self, id: Uuid, next: JobStatus) -> StoreResult<Job> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or_else(|| StoreError::not_found("job", id))?;
        job.transition(next)?;
        Ok(job.clone())
    }

    fn transition_step(&self, id: Uuid, next: JobStatus) -> StoreResult<JobStep> {
        let mut steps = self.job_steps.write();
        let step = steps
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job_step", id))?;
        step.transition(next)?;
        Ok(step.clone())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: Job) -> StoreResult<Job> {
        self.job_order.write().push(job.id);
        self.jobs.write().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Job> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("job", id))
    }

    async fn update_job(&self, job: Job) -> StoreResult<Job> {
        self.jobs.write().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_next_queued_job(&self) -> StoreResult<Option<Job>> {
        // Peek only: this does not claim the job. The worker claims it by
        // calling `mark_job_running`, whose own transition check is what
        // makes concurrent claims of the same id race-safe (the loser's
        // `Queued -> Running` transition fails because the winner already
        // flipped the status).
        let order = self.job_order.read().clone();
        let jobs = self.jobs.read();
        for id in order {
            if let Some(job) = jobs.get(&id) {
                if job.status == JobStatus::Queued {
                    return Ok(Some(job.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn mark_job_running(&self, id: Uuid) -> StoreResult<Job> {
        self.transition_job(id, JobStatus::Running)
    }

    async fn mark_job_completed(&self, id: Uuid, output: serde_json::Value) -> StoreResult<Job> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or_else(|| StoreError::not_found("job", id))?;
        job.transition(JobStatus::Completed)?;
        job.output_data = output;
        Ok(job.clone())
    }

    async fn mark_job_failed(&self, id: Uuid, error: String) -> StoreResult<Job> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or_else(|| StoreError::not_found("job", id))?;
        job.transition(JobStatus::Failed)?;
        job.error_message = Some(error);
        Ok(job.clone())
    }

    async fn cancel_job(&self, id: Uuid) -> StoreResult<Job> {
        self.transition_job(id, JobStatus::Cancelled)
    }

    async fn create_job_step(&self, step: JobStep) -> StoreResult<JobStep> {
        self.job_steps.write().insert(step.id, step.clone());
        Ok(step)
    }

    async fn get_job_step(&self, id: Uuid) -> StoreResult<JobStep> {
        self.job_steps
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("job_step", id))
    }

    async fn list_job_steps(&self, job_id: Uuid) -> StoreResult<Vec<JobStep>> {
        let mut steps: Vec<JobStep> = self
            .job_steps
            .read()
            .values()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_order);
        Ok(steps)
    }

    async fn mark_job_step_running(&self, id: Uuid) -> StoreResult<JobStep> {
        self.transition_step(id, JobStatus::Running)
    }

    async fn mark_job_step_completed(
        &self,
        id: Uuid,
        output: serde_json::Value,
    ) -> StoreResult<JobStep> {
        let mut steps = self.job_steps.write();
        let step = steps
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job_step", id))?;
        step.transition(JobStatus::Completed)?;
        step.output_data = output;
        Ok(step.clone())
    }

    async fn mark_job_step_failed(&self, id: Uuid, error: String) -> StoreResult<JobStep> {
        let mut steps = self.job_steps.write();
        let step = steps
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job_step", id))?;
        step.transition(JobStatus::Failed)?;
        step.error_message = Some(error);
        Ok(step.clone())
    }
}
