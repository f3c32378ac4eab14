//! The glue that lets `loom-wasm` and `loom-agent` call back into the
//! rest of the system without either crate depending on `loom-engine`
//! directly: [`EngineExecutionHost`] implements `loom_wasm::ExecutionHost`
//! and [`EngineWorkflowSubmitter`] implements `loom_agent::WorkflowSubmitter`.
//! Both hold only store handles plus an `AgentRuntime`, never an `Engine`
//! itself — `Engine::new` needs a constructed `WasmExecutor`, which in
//! turn needs an `ExecutionHost`, so the host can't wait for the engine
//! to exist.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use loom_agent::{AgentError, AgentResult, AgentRuntime, WorkflowSubmitter};
use loom_core::carry;
use loom_core::model::{Job, JobStatus, SettingKey};
use loom_store::{JobStore, PrimitiveStore, StoreError};
use loom_wasm::{error::ERR_NOT_FOUND, ExecutionHost, TargetKind, WasmError, WasmResult};
use uuid::Uuid;

use crate::waiter::SyncWaiter;

/// Resolve an `id` argument that may be either a catalog UUID or a
/// workflow name, the same convention `AgentRuntime::resolve_agent_by_name`
/// uses for agents.
async fn resolve_workflow_id(primitive_store: &Arc<dyn PrimitiveStore>, id: &str) -> Option<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        if primitive_store.get_workflow(uuid).await.is_ok() {
            return Some(uuid);
        }
    }
    primitive_store
        .list_workflows()
        .await
        .ok()?
        .into_iter()
        .find(|w| w.name.eq_ignore_ascii_case(id))
        .map(|w| w.id)
}

async fn resolve_agent_id(primitive_store: &Arc<dyn PrimitiveStore>, id: &str) -> Option<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        if primitive_store.get_agent(uuid).await.is_ok() {
            return Some(uuid);
        }
    }
    primitive_store
        .list_agents()
        .await
        .ok()?
        .into_iter()
        .find(|a| a.name.eq_ignore_ascii_case(id))
        .map(|a| a.id)
}

/// Implements [`WorkflowSubmitter`] so `AgentRuntime::execute_workflow`
/// can submit/await jobs from inside a tool call without `loom-agent`
/// depending on the scheduler.
pub struct EngineWorkflowSubmitter {
    job_store: Arc<dyn JobStore>,
    primitive_store: Arc<dyn PrimitiveStore>,
    waiter: SyncWaiter,
}

impl EngineWorkflowSubmitter {
    #[must_use]
    pub fn new(
        job_store: Arc<dyn JobStore>,
        primitive_store: Arc<dyn PrimitiveStore>,
        waiter_poll_interval: Duration,
    ) -> Self {
        let waiter = SyncWaiter::new(Arc::clone(&job_store), waiter_poll_interval);
        Self {
            job_store,
            primitive_store,
            waiter,
        }
    }

    async fn submit_job(&self, workflow_name: &str, input: serde_json::Value) -> AgentResult<Job> {
        let workflow_id = resolve_workflow_id(&self.primitive_store, workflow_name)
            .await
            .ok_or_else(|| AgentError::WorkflowNotFound(workflow_name.to_string()))?;
        let job = Job::new(Some(workflow_id), None, input, None);
        self.job_store.create_job(job).await.map_err(AgentError::from)
    }
}

#[async_trait]
impl WorkflowSubmitter for EngineWorkflowSubmitter {
    async fn submit(&self, workflow_name: &str, input: serde_json::Value) -> AgentResult<Job> {
        self.submit_job(workflow_name, input).await
    }

    async fn submit_and_wait(&self, workflow_name: &str, input: serde_json::Value) -> AgentResult<Job> {
        let job = self.submit_job(workflow_name, input).await?;

        let timeout_secs = match self
            .primitive_store
            .get_setting(SettingKey::TimeoutWorkflowSeconds.as_str())
            .await
        {
            Ok(raw) => loom_core::model::parse_timeout_setting(SettingKey::TimeoutWorkflowSeconds, raw.as_deref())
                .unwrap_or_else(|_| SettingKey::TimeoutWorkflowSeconds.default_value()),
            Err(_) => SettingKey::TimeoutWorkflowSeconds.default_value(),
        };

        self.waiter
            .wait(job.id, Duration::from_secs(timeout_secs))
            .await
            .map_err(|e| AgentError::Other(e.into()))
    }
}

/// Implements [`ExecutionHost`] so a WASM step's `execute_target`,
/// `get_job_output`, and `wait_for_job_and_get_output` host calls can
/// submit new jobs and read job state without `loom-wasm` depending on
/// the scheduler.
pub struct EngineExecutionHost {
    job_store: Arc<dyn JobStore>,
    primitive_store: Arc<dyn PrimitiveStore>,
    agent_runtime: Arc<AgentRuntime>,
}

impl EngineExecutionHost {
    #[must_use]
    pub fn new(
        job_store: Arc<dyn JobStore>,
        primitive_store: Arc<dyn PrimitiveStore>,
        agent_runtime: Arc<AgentRuntime>,
    ) -> Self {
        Self {
            job_store,
            primitive_store,
            agent_runtime,
        }
    }
}

#[async_trait]
impl ExecutionHost for EngineExecutionHost {
    async fn execute_target(
        &self,
        kind: TargetKind,
        id: &str,
        params: serde_json::Value,
    ) -> WasmResult<serde_json::Value> {
        match kind {
            TargetKind::Workflow => {
                let workflow_id = resolve_workflow_id(&self.primitive_store, id).await.ok_or_else(|| {
                    WasmError::Capability {
                        reason: format!("workflow '{id}' not found"),
                        code: ERR_NOT_FOUND,
                    }
                })?;
                let job = Job::new(Some(workflow_id), None, params, None);
                let job = self
                    .job_store
                    .create_job(job)
                    .await
                    .map_err(|e| WasmError::Other(e.into()))?;
                Ok(serde_json::json!({ "job_id": job.id.to_string(), "status": "queued" }))
            }
            TargetKind::Agent => {
                let agent_id = resolve_agent_id(&self.primitive_store, id).await.ok_or_else(|| {
                    WasmError::Capability {
                        reason: format!("agent '{id}' not found"),
                        code: ERR_NOT_FOUND,
                    }
                })?;
                let prompt = carry::unwrap_prompt(&params);
                // Not attributed to any particular job step; the agent
                // runtime only uses this id to scope tool context.
                let completion = self
                    .agent_runtime
                    .execute_agent_by_id(Uuid::nil(), agent_id, prompt)
                    .await
                    .map_err(|e| WasmError::Upstream(e.to_string()))?;
                let reply = completion
                    .choices
                    .first()
                    .and_then(|choice| choice.message.content.clone())
                    .unwrap_or_default();
                Ok(serde_json::json!({ "reply": reply }))
            }
        }
    }

    async fn get_job_output(&self, job_id: Uuid) -> WasmResult<Option<serde_json::Value>> {
        match self.job_store.get_job(job_id).await {
            Ok(job) => Ok(Some(job.output_data)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(WasmError::Other(e.into())),
        }
    }

    async fn wait_for_job_output(&self, job_id: Uuid, deadline: Instant) -> WasmResult<serde_json::Value> {
        loop {
            let job = self
                .job_store
                .get_job(job_id)
                .await
                .map_err(|e| WasmError::Other(e.into()))?;
            if job.status.is_terminal() {
                return match job.status {
                    JobStatus::Completed => Ok(job.output_data),
                    _ => Err(WasmError::Upstream(
                        job.error_message
                            .unwrap_or_else(|| format!("job ended in status {:?}", job.status)),
                    )),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WasmError::Deadline);
            }
            tokio::time::sleep(Duration::from_millis(200).min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_agent::llm_client::LlmClient;
    use loom_core::model::{Agent, Tool, WasmModule, Workflow, WorkflowStep};
    use loom_store::memory::MemoryJobStore;
    use loom_store::StoreResult;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    /// Answers every catalog lookup with `NotFound`/empty, enough to
    /// exercise the id-resolution paths without a real catalog.
    #[derive(Debug, Default)]
    struct EmptyStore;

    #[async_trait]
    impl PrimitiveStore for EmptyStore {
        async fn get_provider(&self, id: Uuid) -> StoreResult<loom_core::model::Provider> {
            Err(StoreError::not_found("provider", id))
        }
        async fn get_agent(&self, id: Uuid) -> StoreResult<Agent> {
            Err(StoreError::not_found("agent", id))
        }
        async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
            Ok(Vec::new())
        }
        async fn get_agent_tools(&self, _agent_id: Uuid) -> StoreResult<Vec<Tool>> {
            Ok(Vec::new())
        }
        async fn get_tool(&self, id: Uuid) -> StoreResult<Tool> {
            Err(StoreError::not_found("tool", id))
        }
        async fn get_workflow(&self, id: Uuid) -> StoreResult<Workflow> {
            Err(StoreError::not_found("workflow", id))
        }
        async fn list_workflows(&self) -> StoreResult<Vec<Workflow>> {
            Ok(Vec::new())
        }
        async fn list_workflow_steps(&self, _workflow_id: Uuid) -> StoreResult<Vec<WorkflowStep>> {
            Ok(Vec::new())
        }
        async fn get_wasm_module(&self, id: Uuid) -> StoreResult<WasmModule> {
            Err(StoreError::not_found("wasm_module", id))
        }
        async fn get_setting(&self, _key: &str) -> StoreResult<Option<String>> {
            Ok(None)
        }
    }

    struct NoopSubmitter;

    #[async_trait]
    impl WorkflowSubmitter for NoopSubmitter {
        async fn submit(&self, name: &str, _input: serde_json::Value) -> AgentResult<Job> {
            Err(AgentError::WorkflowNotFound(name.to_string()))
        }
        async fn submit_and_wait(&self, name: &str, _input: serde_json::Value) -> AgentResult<Job> {
            Err(AgentError::WorkflowNotFound(name.to_string()))
        }
    }

    fn agent_runtime() -> Arc<AgentRuntime> {
        let store: Arc<dyn PrimitiveStore> = Arc::new(EmptyStore);
        let llm = LlmClient::new(StdDuration::from_secs(5)).expect("client builds");
        let submitter: Arc<dyn WorkflowSubmitter> = Arc::new(NoopSubmitter);
        Arc::new(AgentRuntime::new(store, llm, submitter))
    }

    #[tokio::test]
    async fn get_job_output_returns_none_for_unknown_job() {
        let job_store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let primitive_store: Arc<dyn PrimitiveStore> = Arc::new(EmptyStore);
        let host = EngineExecutionHost::new(job_store, primitive_store, agent_runtime());
        let result = host.get_job_output(Uuid::new_v4()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn get_job_output_returns_snapshot_for_running_job() {
        let job_store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let primitive_store: Arc<dyn PrimitiveStore> = Arc::new(EmptyStore);
        let job = Job::new(None, None, json!({}), None);
        let id = job.id;
        job_store.create_job(job).await.unwrap();
        job_store.mark_job_running(id).await.unwrap();

        let host = EngineExecutionHost::new(job_store, primitive_store, agent_runtime());
        let result = host.get_job_output(id).await.unwrap();
        assert_eq!(result, Some(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn execute_target_rejects_unknown_workflow() {
        let job_store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let primitive_store: Arc<dyn PrimitiveStore> = Arc::new(EmptyStore);
        let host = EngineExecutionHost::new(job_store, primitive_store, agent_runtime());
        let err = host
            .execute_target(TargetKind::Workflow, "missing", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, WasmError::Capability { code, .. } if code == ERR_NOT_FOUND));
    }
}
