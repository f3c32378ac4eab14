//! `AgentRuntime`: `ExecuteAgent`'s single-message assembly plus bounded
//! tool-call loop, `ExecuteWorkflow`'s thin adapter into a submitter the
//! caller injects, and the `model` prefix dispatch that backs the
//! submission API.

use std::sync::Arc;

use async_trait::async_trait;
use loom_core::model::{Agent, Job};
use loom_store::PrimitiveStore;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{AgentError, AgentResult};
use crate::llm_client::{estimate_tokens, ChatMessage, ChatRequest, ChatUsage, LlmClient, ToolDeclaration};
use crate::tools::{self, ToolContext};

const MAX_TOOL_ITERATIONS: u32 = 10;
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// A completion in the shape the submission API returns for both
/// `agent/<name>` calls and (after conversion) workflow results.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Completion {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: ChatUsage,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CompletionChoice {
    pub message: ChatMessage,
    pub finish_reason: String,
}

/// A single chat-completion request, as accepted by the submission API.
#[derive(Debug, Clone)]
pub struct AgentQueryRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// The parsed form of the submission API's `model` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutedTarget {
    Agent(String),
    SyncWorkflow(String),
    AsyncWorkflow(String),
}

/// Parse `model`'s prefix dispatch: `agent/<name>`, `workflow/<name>`,
/// `async/workflow/<name>`.
pub fn route_model(model: &str) -> AgentResult<RoutedTarget> {
    if let Some(name) = model.strip_prefix("agent/") {
        if name.is_empty() {
            return Err(AgentError::InvalidModel(model.to_string()));
        }
        return Ok(RoutedTarget::Agent(name.to_string()));
    }
    if let Some(name) = model.strip_prefix("async/workflow/") {
        if name.is_empty() {
            return Err(AgentError::InvalidModel(model.to_string()));
        }
        return Ok(RoutedTarget::AsyncWorkflow(name.to_string()));
    }
    if let Some(name) = model.strip_prefix("workflow/") {
        if name.is_empty() {
            return Err(AgentError::InvalidModel(model.to_string()));
        }
        return Ok(RoutedTarget::SyncWorkflow(name.to_string()));
    }
    Err(AgentError::InvalidModel(model.to_string()))
}

/// Dependency-inversion seam so `loom-agent` never depends on
/// `loom-engine`: the engine implements this and injects itself so
/// `ExecuteWorkflow` can submit jobs and (for the synchronous route)
/// wait for their terminal state.
#[async_trait]
pub trait WorkflowSubmitter: Send + Sync {
    async fn submit(&self, workflow_name: &str, input: serde_json::Value) -> AgentResult<Job>;

    /// Submit and block until the job reaches a terminal state or the
    /// configured `timeout_workflow_seconds` elapses.
    async fn submit_and_wait(&self, workflow_name: &str, input: serde_json::Value) -> AgentResult<Job>;
}

pub struct AgentRuntime {
    store: Arc<dyn PrimitiveStore>,
    llm: LlmClient,
    submitter: Arc<dyn WorkflowSubmitter>,
}

impl AgentRuntime {
    #[must_use]
    pub fn new(store: Arc<dyn PrimitiveStore>, llm: LlmClient, submitter: Arc<dyn WorkflowSubmitter>) -> Self {
        Self { store, llm, submitter }
    }

    async fn resolve_agent_by_name(&self, name: &str) -> AgentResult<Agent> {
        let agents = self.store.list_agents().await?;
        agents
            .into_iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| AgentError::AgentNotFound(name.to_string()))
    }

    /// Resolve an agent's enabled tools into declarations plus a lookup
    /// table keyed by declared name, so a model's tool call can be
    /// dispatched back to the concrete `Tool` row and implementation.
    async fn resolve_tools(
        &self,
        agent_id: Uuid,
    ) -> AgentResult<(Vec<ToolDeclaration>, Vec<(loom_core::model::Tool, Arc<dyn tools::ToolImpl>)>)> {
        let enabled = self.store.get_agent_tools(agent_id).await?;
        let mut declarations = Vec::with_capacity(enabled.len());
        let mut resolved = Vec::with_capacity(enabled.len());
        for tool in enabled {
            let implementation = tools::resolve(tool.tool_type);
            declarations.push(implementation.declaration(&tool));
            resolved.push((tool, implementation));
        }
        Ok((declarations, resolved))
    }

    #[instrument(skip(self, req), fields(model = %req.model))]
    pub async fn execute_agent(&self, job_id: Uuid, req: AgentQueryRequest) -> AgentResult<Completion> {
        let RoutedTarget::Agent(name) = route_model(&req.model)? else {
            return Err(AgentError::InvalidModel(req.model));
        };

        let agent = self.resolve_agent_by_name(&name).await?;
        let mut messages = Vec::new();
        if let Some(system_prompt) = &agent.system_prompt {
            messages.push(ChatMessage::system(system_prompt.clone()));
        }
        messages.extend(req.messages);

        self.run_agent(job_id, agent, messages).await
    }

    /// The scheduler's agent-step adapter calls this directly: the
    /// workflow step already names an `agent_id`, so there is no
    /// `model` string to parse.
    #[instrument(skip(self, prompt), fields(%agent_id))]
    pub async fn execute_agent_by_id(&self, job_id: Uuid, agent_id: Uuid, prompt: String) -> AgentResult<Completion> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await
            .map_err(|_| AgentError::AgentNotFound(agent_id.to_string()))?;

        let mut messages = Vec::new();
        if let Some(system_prompt) = &agent.system_prompt {
            messages.push(ChatMessage::system(system_prompt.clone()));
        }
        messages.push(ChatMessage::user(prompt));

        self.run_agent(job_id, agent, messages).await
    }

    async fn run_agent(&self, job_id: Uuid, agent: Agent, mut messages: Vec<ChatMessage>) -> AgentResult<Completion> {
        let provider = self.store.get_provider(agent.provider_id).await?;

        let (declarations, resolved_tools) = self.resolve_tools(agent.id).await?;
        let tool_ctx = ToolContext {
            agent_id: agent.id,
            job_id,
            working_dir: None,
            store: Arc::clone(&self.store),
        };

        let tools_for_request = (!declarations.is_empty()).then_some(declarations);

        let mut final_response = None;
        for iteration in 0..MAX_TOOL_ITERATIONS {
            let request = ChatRequest {
                model: agent.model_id.clone(),
                messages: messages.clone(),
                tools: tools_for_request.clone(),
                temperature: DEFAULT_TEMPERATURE,
            };
            let response = self.llm.chat(&provider, &request).await?;
            let choice = response.choices.first().ok_or(AgentError::EmptyCompletion)?.clone();

            let Some(tool_calls) = &choice.message.tool_calls else {
                final_response = Some(response);
                break;
            };
            if tool_calls.is_empty() {
                final_response = Some(response);
                break;
            }

            messages.push(choice.message.clone());
            for call in tool_calls {
                let args: serde_json::Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::Value::Null);
                let result = match resolved_tools.iter().find(|(t, _)| t.name == call.function.name) {
                    Some((tool, implementation)) => implementation.call(tool, &tool_ctx, args).await,
                    None => serde_json::json!({"error": format!("unknown tool '{}'", call.function.name)}),
                };
                messages.push(ChatMessage::tool(call.id.clone(), result.to_string()));
            }

            if iteration + 1 == MAX_TOOL_ITERATIONS {
                warn!(agent = %agent.name, "tool-call loop hit the iteration budget; using the last reply");
                final_response = Some(response);
            }
        }

        let response = final_response.ok_or(AgentError::EmptyCompletion)?;
        let choice = response.choices.into_iter().next().ok_or(AgentError::EmptyCompletion)?;

        let usage = response.usage.unwrap_or_else(|| {
            let prompt_text: String = messages.iter().filter_map(|m| m.content.clone()).collect();
            let completion_text = choice.message.content.clone().unwrap_or_default();
            let prompt_tokens = estimate_tokens(&prompt_text);
            let completion_tokens = estimate_tokens(&completion_text);
            ChatUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }
        });

        info!(agent = %agent.name, "agent execution complete");

        Ok(Completion {
            id: response.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            created: chrono::Utc::now().timestamp(),
            model: response.model.unwrap_or(agent.model_id),
            choices: vec![CompletionChoice {
                message: choice.message,
                finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            }],
            usage,
        })
    }

    /// `ExecuteWorkflow`: submit via the injected `WorkflowSubmitter`,
    /// blocking for the synchronous route and returning immediately for
    /// the async route.
    pub async fn execute_workflow(&self, model: &str, input: serde_json::Value) -> AgentResult<Job> {
        match route_model(model)? {
            RoutedTarget::SyncWorkflow(name) => self.submitter.submit_and_wait(&name, input).await,
            RoutedTarget::AsyncWorkflow(name) => self.submitter.submit(&name, input).await,
            RoutedTarget::Agent(_) => Err(AgentError::InvalidModel(model.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use loom_core::model::{Provider, Tool, WasmModule, Workflow, WorkflowStep};
    use loom_store::{StoreError, StoreResult};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn route_model_dispatches_every_prefix() {
        assert_eq!(route_model("agent/triage").unwrap(), RoutedTarget::Agent("triage".to_string()));
        assert_eq!(
            route_model("workflow/onboarding").unwrap(),
            RoutedTarget::SyncWorkflow("onboarding".to_string())
        );
        assert_eq!(
            route_model("async/workflow/onboarding").unwrap(),
            RoutedTarget::AsyncWorkflow("onboarding".to_string())
        );
    }

    #[test]
    fn route_model_rejects_unknown_prefixes_and_empty_names() {
        assert!(route_model("gpt-4").is_err());
        assert!(route_model("agent/").is_err());
        assert!(route_model("workflow/").is_err());
    }

    /// A fixed `Agent`/`Provider` pair, everything else `NotFound`/empty —
    /// enough to drive `run_agent` against a mock LLM endpoint.
    struct FixtureStore {
        provider: Provider,
        agent: Agent,
    }

    #[async_trait]
    impl PrimitiveStore for FixtureStore {
        async fn get_provider(&self, id: Uuid) -> StoreResult<Provider> {
            if id == self.provider.id {
                Ok(self.provider.clone())
            } else {
                Err(StoreError::not_found("provider", id))
            }
        }
        async fn get_agent(&self, id: Uuid) -> StoreResult<Agent> {
            if id == self.agent.id {
                Ok(self.agent.clone())
            } else {
                Err(StoreError::not_found("agent", id))
            }
        }
        async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
            Ok(vec![self.agent.clone()])
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

    fn fixture_agent(provider_id: Uuid) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "looper".to_string(),
            description: None,
            provider_id,
            model_id: "test-model".to_string(),
            system_prompt: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
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

    /// Scenario: single agent call, happy path. A provider that always
    /// replies with a plain-text completion yields that text back as the
    /// completion's first choice.
    #[tokio::test]
    async fn execute_agent_by_id_returns_the_providers_reply() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "model": "test-model",
                "choices": [{
                    "message": {"role": "assistant", "content": "hi there"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = fixture_provider(mock_server.uri());
        let agent = fixture_agent(provider.id);
        let store: Arc<dyn PrimitiveStore> = Arc::new(FixtureStore {
            provider,
            agent: agent.clone(),
        });
        let llm = LlmClient::new(Duration::from_secs(5)).unwrap();
        let submitter: Arc<dyn WorkflowSubmitter> = Arc::new(NoopSubmitter);
        let runtime = AgentRuntime::new(store, llm, submitter);

        let completion = runtime
            .execute_agent_by_id(Uuid::nil(), agent.id, "say hi".to_string())
            .await
            .unwrap();
        assert_eq!(completion.choices[0].message.content.as_deref(), Some("hi there"));
    }

    /// Scenario: tool-call loop bounded. A model that always replies with
    /// a function call never gets a final answer, so the runtime must
    /// stop after `MAX_TOOL_ITERATIONS` requests and return the last
    /// reply rather than looping forever.
    #[tokio::test]
    async fn tool_call_loop_stops_after_ten_iterations() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-loop",
                "model": "test-model",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "tool_calls": [{
                            "id": "call-1",
                            "type": "function",
                            "function": {"name": "always_call", "arguments": "{}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
            })))
            .expect(10)
            .mount(&mock_server)
            .await;

        let provider = fixture_provider(mock_server.uri());
        let agent = fixture_agent(provider.id);
        let store: Arc<dyn PrimitiveStore> = Arc::new(FixtureStore {
            provider,
            agent: agent.clone(),
        });
        let llm = LlmClient::new(Duration::from_secs(5)).unwrap();
        let submitter: Arc<dyn WorkflowSubmitter> = Arc::new(NoopSubmitter);
        let runtime = AgentRuntime::new(store, llm, submitter);

        let completion = runtime
            .execute_agent_by_id(Uuid::nil(), agent.id, "go".to_string())
            .await
            .unwrap();
        assert_eq!(completion.choices[0].finish_reason, "tool_calls");
        // `.expect(10)` on the mock is verified when `mock_server` drops:
        // exactly ten requests, never an eleventh.
    }
}
