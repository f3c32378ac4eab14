//! End-to-end scenarios driven through the public `Engine` API only:
//! submit a job, let the worker pool run it, observe the terminal
//! state. No internal scheduler method is called directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_agent::llm_client::LlmClient;
use loom_agent::{AgentError, AgentResult, AgentRuntime, WorkflowSubmitter};
use loom_core::model::{Agent, Job, JobStatus, Provider, WasmModule, Workflow, WorkflowStep};
use loom_engine::{Engine, EngineConfig, EngineExecutionHost};
use loom_store::memory::{MemoryJobStore, MemoryPrimitiveStore};
use loom_store::{JobStore, PrimitiveStore, StoreResult};
use loom_wasm::{WasmExecutor, WasmExecutorConfig};
use tokio::sync::Notify;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config() -> EngineConfig {
    EngineConfig {
        worker_count: 1,
        max_queue_size: 10,
        poll_interval: Duration::from_millis(20),
        waiter_poll_interval: Duration::from_millis(20),
    }
}

fn fixture_provider(base_url: String) -> Provider {
    Provider {
        id: Uuid::new_v4(),
        name: "test-provider".to_string(),
        api_base_url: base_url,
        api_key: "test-key".to_string(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

fn fixture_agent(provider_id: Uuid) -> Agent {
    Agent {
        id: Uuid::new_v4(),
        name: "scenario-agent".to_string(),
        description: None,
        provider_id,
        model_id: "test-model".to_string(),
        system_prompt: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

fn fixture_workflow(name: &str) -> Workflow {
    Workflow {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: None,
        is_async: false,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

fn fixture_wasm_module(name: &str, bytes: Vec<u8>, config: serde_json::Value) -> WasmModule {
    WasmModule {
        id: Uuid::new_v4(),
        name: name.to_string(),
        description: None,
        module_bytes: bytes,
        config,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
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

/// Builds an `AgentRuntime` pointed at `mock_uri` (or nowhere, for
/// scenarios that never reach the agent runtime).
fn agent_runtime(store: Arc<dyn PrimitiveStore>) -> Arc<AgentRuntime> {
    let llm = LlmClient::new(Duration::from_secs(5)).unwrap();
    let submitter: Arc<dyn WorkflowSubmitter> = Arc::new(NoopSubmitter);
    Arc::new(AgentRuntime::new(store, llm, submitter))
}

fn wasm_executor(execution_host: Arc<dyn loom_wasm::ExecutionHost>, config: WasmExecutorConfig) -> Arc<WasmExecutor> {
    Arc::new(WasmExecutor::new(config, execution_host).unwrap())
}

async fn wait_for_terminal(job_store: &Arc<dyn JobStore>, job_id: Uuid) -> Job {
    for _ in 0..200 {
        let job = job_store.get_job(job_id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

/// A relay module: ignores its input and writes a fixed JSON `message`
/// to stdout, so a downstream step can observe that the WASM step ran.
fn relay_module_wat() -> Vec<u8> {
    wat::parse_str(
        r#"
        (module
          (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 100) "{\"message\":\"relayed\"}")
          (func $start (export "_start")
            (i32.store (i32.const 0) (i32.const 100))
            (i32.store (i32.const 4) (i32.const 21))
            (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 16))))
        )
        "#,
    )
    .unwrap()
}

/// Calls `env.http_request` against a URL outside the executor's
/// allow-list and reports whether the host denied it, without ever
/// touching the network.
fn url_probe_module_wat() -> Vec<u8> {
    wat::parse_str(
        r#"
        (module
          (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (import "env" "http_request"
            (func $http_request (param i32 i32 i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 100) "GET")
          (data (i32.const 200) "https://evil.example/secret")
          (data (i32.const 300) "{\"message\":\"denied\"}")
          (data (i32.const 350) "{\"message\":\"allowed\"}")
          (func $start (export "_start")
            (local $result i32)
            (local.set $result
              (call $http_request
                (i32.const 100) (i32.const 3)
                (i32.const 200) (i32.const 27)
                (i32.const 0) (i32.const 0)))
            (if (i32.eq (local.get $result) (i32.const -2))
              (then
                (i32.store (i32.const 0) (i32.const 300))
                (i32.store (i32.const 4) (i32.const 20)))
              (else
                (i32.store (i32.const 0) (i32.const 350))
                (i32.store (i32.const 4) (i32.const 21))))
            (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 16))))
        )
        "#,
    )
    .unwrap()
}

/// Never returns: burns fuel forever. The executor's fuel budget must
/// trap it rather than let it hang the worker.
fn runaway_module_wat() -> Vec<u8> {
    wat::parse_str(
        r#"
        (module
          (memory (export "memory") 1)
          (func $start (export "_start")
            (loop $l (br $l)))
        )
        "#,
    )
    .unwrap()
}

/// Scenario: a single-agent workflow runs to completion and the job's
/// final output carries the agent's reply.
#[tokio::test]
async fn agent_only_workflow_completes_with_the_agents_reply() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "chatcmpl-1",
            "model": "test-model",
            "choices": [{
                "message": {"role": "assistant", "content": "hello from the agent"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
        })))
        .mount(&mock_server)
        .await;

    let provider = fixture_provider(mock_server.uri());
    let agent = fixture_agent(provider.id);
    let workflow = fixture_workflow("single-agent");
    let step = WorkflowStep::for_agent(workflow.id, 1, agent.id, serde_json::json!({})).unwrap();

    let primitive_store = Arc::new(MemoryPrimitiveStore::new());
    primitive_store.seed_provider(provider);
    primitive_store.seed_agent(agent);
    primitive_store.seed_workflow(workflow.clone(), vec![step]);
    let primitive_store: Arc<dyn PrimitiveStore> = primitive_store;

    let job_store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let runtime = agent_runtime(Arc::clone(&primitive_store));
    let host: Arc<dyn loom_wasm::ExecutionHost> =
        Arc::new(EngineExecutionHost::new(Arc::clone(&job_store), Arc::clone(&primitive_store), Arc::clone(&runtime)));
    let executor = wasm_executor(host, WasmExecutorConfig::default());

    let engine = Arc::new(Engine::new(
        test_config(),
        Arc::clone(&job_store),
        Arc::clone(&primitive_store),
        runtime,
        executor,
    ));
    engine.start().await.unwrap();

    let job = engine.submit_job(workflow.id, serde_json::json!({"prompt": "hi"})).await.unwrap();
    let job = wait_for_terminal(&job_store, job.id).await;

    engine.stop().await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.output_data, serde_json::json!({"prompt": "hello from the agent"}));
}

/// Scenario: an agent step feeds a WASM step. The job completes with
/// the WASM step's output, proving the carry threaded across steps.
#[tokio::test]
async fn agent_then_wasm_workflow_chains_the_carry() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "chatcmpl-2",
            "model": "test-model",
            "choices": [{
                "message": {"role": "assistant", "content": "draft text"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 2, "completion_tokens": 2, "total_tokens": 4}
        })))
        .mount(&mock_server)
        .await;

    let provider = fixture_provider(mock_server.uri());
    let agent = fixture_agent(provider.id);
    let module = fixture_wasm_module("relay", relay_module_wat(), serde_json::json!({}));
    let workflow = fixture_workflow("agent-then-wasm");
    let step1 = WorkflowStep::for_agent(workflow.id, 1, agent.id, serde_json::json!({})).unwrap();
    let step2 = WorkflowStep::for_wasm(workflow.id, 2, module.id, serde_json::json!({})).unwrap();

    let primitive_store = Arc::new(MemoryPrimitiveStore::new());
    primitive_store.seed_provider(provider);
    primitive_store.seed_agent(agent);
    primitive_store.seed_wasm_module(module);
    primitive_store.seed_workflow(workflow.clone(), vec![step1, step2]);
    let primitive_store: Arc<dyn PrimitiveStore> = primitive_store;

    let job_store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let runtime = agent_runtime(Arc::clone(&primitive_store));
    let host: Arc<dyn loom_wasm::ExecutionHost> =
        Arc::new(EngineExecutionHost::new(Arc::clone(&job_store), Arc::clone(&primitive_store), Arc::clone(&runtime)));
    let executor = wasm_executor(host, WasmExecutorConfig::default());

    let engine = Arc::new(Engine::new(
        test_config(),
        Arc::clone(&job_store),
        Arc::clone(&primitive_store),
        runtime,
        executor,
    ));
    engine.start().await.unwrap();

    let job = engine.submit_job(workflow.id, serde_json::json!({"prompt": "go"})).await.unwrap();
    let job = wait_for_terminal(&job_store, job.id).await;

    engine.stop().await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.output_data, serde_json::json!("relayed"));

    let steps = job_store.list_job_steps(job.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.status == JobStatus::Completed));
}

/// Scenario: a WASM module tries to reach a host outside the
/// executor's allow-list. The host ABI denies the call before any
/// network I/O happens, and the module reports the denial rather than
/// the job crashing.
#[tokio::test]
async fn wasm_module_is_denied_a_disallowed_url() {
    let module = fixture_wasm_module("url-probe", url_probe_module_wat(), serde_json::json!({}));
    let workflow = fixture_workflow("wasm-only");
    let step = WorkflowStep::for_wasm(workflow.id, 1, module.id, serde_json::json!({})).unwrap();

    let primitive_store = Arc::new(MemoryPrimitiveStore::new());
    primitive_store.seed_wasm_module(module);
    primitive_store.seed_workflow(workflow.clone(), vec![step]);
    let primitive_store: Arc<dyn PrimitiveStore> = primitive_store;

    let job_store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let runtime = agent_runtime(Arc::clone(&primitive_store));
    let host: Arc<dyn loom_wasm::ExecutionHost> =
        Arc::new(EngineExecutionHost::new(Arc::clone(&job_store), Arc::clone(&primitive_store), Arc::clone(&runtime)));
    let restrictive_config = WasmExecutorConfig {
        allowed_url_prefixes: vec!["https://api.internal.example/".to_string()],
        ..WasmExecutorConfig::default()
    };
    let executor = wasm_executor(host, restrictive_config);

    let engine = Arc::new(Engine::new(
        test_config(),
        Arc::clone(&job_store),
        Arc::clone(&primitive_store),
        runtime,
        executor,
    ));
    engine.start().await.unwrap();

    let job = engine.submit_job(workflow.id, serde_json::json!({})).await.unwrap();
    let job = wait_for_terminal(&job_store, job.id).await;

    engine.stop().await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.output_data, serde_json::json!("denied"));
}

/// Scenario: a WASM module that never yields control must not hang the
/// worker pool forever — the fuel budget traps it and the job fails.
#[tokio::test]
async fn runaway_wasm_module_fails_instead_of_hanging() {
    let module = fixture_wasm_module("runaway", runaway_module_wat(), serde_json::json!({}));
    let workflow = fixture_workflow("wasm-runaway");
    let step = WorkflowStep::for_wasm(workflow.id, 1, module.id, serde_json::json!({})).unwrap();

    let primitive_store = Arc::new(MemoryPrimitiveStore::new());
    primitive_store.seed_wasm_module(module);
    primitive_store.seed_workflow(workflow.clone(), vec![step]);
    let primitive_store: Arc<dyn PrimitiveStore> = primitive_store;

    let job_store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let runtime = agent_runtime(Arc::clone(&primitive_store));
    let host: Arc<dyn loom_wasm::ExecutionHost> =
        Arc::new(EngineExecutionHost::new(Arc::clone(&job_store), Arc::clone(&primitive_store), Arc::clone(&runtime)));
    let executor = wasm_executor(host, WasmExecutorConfig::default());

    let engine = Arc::new(Engine::new(
        test_config(),
        Arc::clone(&job_store),
        Arc::clone(&primitive_store),
        runtime,
        executor,
    ));
    engine.start().await.unwrap();

    let job = engine.submit_job(workflow.id, serde_json::json!({})).await.unwrap();
    let job = wait_for_terminal(&job_store, job.id).await;

    engine.stop().await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.is_some());
}

/// Delegates every `JobStore` call to an inner `MemoryJobStore`, except
/// `get_job`: the call at the configured ordinal pauses on a `Notify`
/// so the test can cancel the job between the scheduler's pre-step
/// checks for step 1 and step 2.
struct GatedJobStore {
    inner: Arc<MemoryJobStore>,
    get_job_calls: AtomicUsize,
    gate_at_call: usize,
    reached_gate: Notify,
    release_gate: Notify,
}

impl GatedJobStore {
    fn new(inner: Arc<MemoryJobStore>, gate_at_call: usize) -> Self {
        Self {
            inner,
            get_job_calls: AtomicUsize::new(0),
            gate_at_call,
            reached_gate: Notify::new(),
            release_gate: Notify::new(),
        }
    }
}

#[async_trait]
impl JobStore for GatedJobStore {
    async fn create_job(&self, job: Job) -> StoreResult<Job> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Job> {
        let call_number = self.get_job_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call_number == self.gate_at_call {
            self.reached_gate.notify_one();
            self.release_gate.notified().await;
        }
        self.inner.get_job(id).await
    }

    async fn update_job(&self, job: Job) -> StoreResult<Job> {
        self.inner.update_job(job).await
    }

    async fn get_next_queued_job(&self) -> StoreResult<Option<Job>> {
        self.inner.get_next_queued_job().await
    }

    async fn mark_job_running(&self, id: Uuid) -> StoreResult<Job> {
        self.inner.mark_job_running(id).await
    }

    async fn mark_job_completed(&self, id: Uuid, output: serde_json::Value) -> StoreResult<Job> {
        self.inner.mark_job_completed(id, output).await
    }

    async fn mark_job_failed(&self, id: Uuid, error: String) -> StoreResult<Job> {
        self.inner.mark_job_failed(id, error).await
    }

    async fn cancel_job(&self, id: Uuid) -> StoreResult<Job> {
        self.inner.cancel_job(id).await
    }

    async fn create_job_step(&self, step: loom_core::model::JobStep) -> StoreResult<loom_core::model::JobStep> {
        self.inner.create_job_step(step).await
    }

    async fn get_job_step(&self, id: Uuid) -> StoreResult<loom_core::model::JobStep> {
        self.inner.get_job_step(id).await
    }

    async fn list_job_steps(&self, job_id: Uuid) -> StoreResult<Vec<loom_core::model::JobStep>> {
        self.inner.list_job_steps(job_id).await
    }

    async fn mark_job_step_running(&self, id: Uuid) -> StoreResult<loom_core::model::JobStep> {
        self.inner.mark_job_step_running(id).await
    }

    async fn mark_job_step_completed(&self, id: Uuid, output: serde_json::Value) -> StoreResult<loom_core::model::JobStep> {
        self.inner.mark_job_step_completed(id, output).await
    }

    async fn mark_job_step_failed(&self, id: Uuid, error: String) -> StoreResult<loom_core::model::JobStep> {
        self.inner.mark_job_step_failed(id, error).await
    }
}

/// Scenario: cancelling a job between its steps stops the workflow
/// before the next step runs, rather than letting it race to
/// completion.
#[tokio::test]
async fn cancelling_a_job_between_steps_stops_the_workflow() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "chatcmpl-3",
            "model": "test-model",
            "choices": [{
                "message": {"role": "assistant", "content": "step one done"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 2, "completion_tokens": 2, "total_tokens": 4}
        })))
        .mount(&mock_server)
        .await;

    let provider = fixture_provider(mock_server.uri());
    let agent = fixture_agent(provider.id);
    let workflow = fixture_workflow("two-agent-steps");
    let step1 = WorkflowStep::for_agent(workflow.id, 1, agent.id, serde_json::json!({})).unwrap();
    let step2 = WorkflowStep::for_agent(workflow.id, 2, agent.id, serde_json::json!({})).unwrap();

    let primitive_store = Arc::new(MemoryPrimitiveStore::new());
    primitive_store.seed_provider(provider);
    primitive_store.seed_agent(agent);
    primitive_store.seed_workflow(workflow.clone(), vec![step1, step2]);
    let primitive_store: Arc<dyn PrimitiveStore> = primitive_store;

    let inner_job_store = Arc::new(MemoryJobStore::new());
    // Call 1: the top-of-process_job Queued check. Call 2: the
    // pre-step-1 cancellation check. Call 3: the pre-step-2
    // cancellation check — pause there, after step 1 has completed.
    let gated = Arc::new(GatedJobStore::new(Arc::clone(&inner_job_store), 3));
    let job_store: Arc<dyn JobStore> = Arc::clone(&gated) as Arc<dyn JobStore>;

    let runtime = agent_runtime(Arc::clone(&primitive_store));
    let host: Arc<dyn loom_wasm::ExecutionHost> =
        Arc::new(EngineExecutionHost::new(Arc::clone(&job_store), Arc::clone(&primitive_store), Arc::clone(&runtime)));
    let executor = wasm_executor(host, WasmExecutorConfig::default());

    let engine = Arc::new(Engine::new(
        test_config(),
        Arc::clone(&job_store),
        Arc::clone(&primitive_store),
        runtime,
        executor,
    ));
    engine.start().await.unwrap();

    let job = engine.submit_job(workflow.id, serde_json::json!({"prompt": "go"})).await.unwrap();

    gated.reached_gate.notified().await;
    let inner_job_store: Arc<dyn JobStore> = inner_job_store;
    inner_job_store.cancel_job(job.id).await.unwrap();
    gated.release_gate.notify_one();

    let job = wait_for_terminal(&inner_job_store, job.id).await;
    engine.stop().await;

    assert_eq!(job.status, JobStatus::Cancelled);
    let steps = inner_job_store.list_job_steps(job.id).await.unwrap();
    assert_eq!(steps.len(), 1, "only the first step should have run");
    assert_eq!(steps[0].status, JobStatus::Completed);
}
