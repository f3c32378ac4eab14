//! Seeds a single provider/agent/workflow so `loom submit demo-workflow`
//! has a catalog to run against. Catalog provisioning has no admin
//! surface in this scope (see `loom_store::sqlite`'s seed helpers doc
//! comment) — this is the stand-in a local user runs once.

use anyhow::Result;
use chrono::Utc;
use loom_core::model::{Agent, Provider, SettingKey, Workflow, WorkflowStep};
use loom_store::sqlite::{seed_agent, seed_provider, seed_setting, seed_workflow, SqliteHandle};
use uuid::Uuid;

pub async fn seed(handle: &SqliteHandle) -> Result<()> {
    let now = Utc::now();

    let provider = Provider {
        id: Uuid::new_v4(),
        name: "local".to_string(),
        api_base_url: std::env::var("LOOM_LLM_BASE_URL").unwrap_or_else(|_| "http://localhost:11434/v1".to_string()),
        api_key: std::env::var("LOOM_LLM_API_KEY").unwrap_or_else(|_| "not-needed".to_string()),
        created_at: now,
        updated_at: now,
    };
    seed_provider(handle, provider.clone()).await?;

    let agent = Agent {
        id: Uuid::new_v4(),
        name: "demo-agent".to_string(),
        description: Some("A single-turn assistant used by `loom init-demo`.".to_string()),
        provider_id: provider.id,
        model_id: std::env::var("LOOM_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        system_prompt: Some("You are a concise assistant. Answer in one short paragraph.".to_string()),
        created_at: now,
        updated_at: now,
    };
    seed_agent(handle, agent.clone()).await?;

    let workflow = Workflow {
        id: Uuid::new_v4(),
        name: "demo-workflow".to_string(),
        description: Some("One agent step, fed the job's input_data as its prompt.".to_string()),
        is_async: false,
        created_at: now,
        updated_at: now,
    };
    let step = WorkflowStep::for_agent(workflow.id, 1, agent.id, serde_json::json!({}))?;
    seed_workflow(handle, workflow, vec![step]).await?;

    seed_setting(handle, SettingKey::TimeoutWorkflowSeconds.as_str(), "300").await?;
    seed_setting(handle, SettingKey::TimeoutJobSeconds.as_str(), "600").await?;

    Ok(())
}
