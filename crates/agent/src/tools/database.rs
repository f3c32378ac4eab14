//! Narrow read access to the Primitive Store's own catalog tables.
//! There is no arbitrary SQL surface here — a `resource` selects one of
//! a fixed set of catalog lookups and the tool returns rows as JSON.
//! Relational persistence beyond the catalog is an external
//! collaborator's concern, out of scope.

use async_trait::async_trait;
use loom_core::model::Tool;
use uuid::Uuid;

use super::{declaration_for, error_value, object_schema, ToolContext, ToolImpl};
use crate::llm_client::ToolDeclaration;

pub struct DatabaseTool;

#[async_trait]
impl ToolImpl for DatabaseTool {
    fn declaration(&self, tool: &Tool) -> ToolDeclaration {
        declaration_for(
            tool,
            object_schema(
                &["resource"],
                serde_json::json!({
                    "resource": {"type": "string", "enum": ["agents", "agent", "workflow_steps"]},
                    "id": {"type": "string", "description": "UUID, required for resource=agent or workflow_steps"},
                }),
            ),
        )
    }

    async fn call(&self, _tool: &Tool, ctx: &ToolContext, args: serde_json::Value) -> serde_json::Value {
        let Some(resource) = args.get("resource").and_then(|v| v.as_str()) else {
            return error_value("missing required 'resource' field");
        };

        match resource {
            "agents" => match ctx.store.list_agents().await {
                Ok(agents) => serde_json::json!({"rows": agents}),
                Err(e) => error_value(format!("query failed: {e}")),
            },
            "agent" => {
                let Some(id) = args.get("id").and_then(|v| v.as_str()).and_then(|s| Uuid::parse_str(s).ok()) else {
                    return error_value("missing or invalid 'id' field");
                };
                match ctx.store.get_agent(id).await {
                    Ok(agent) => serde_json::json!({"rows": [agent]}),
                    Err(e) => error_value(format!("query failed: {e}")),
                }
            }
            "workflow_steps" => {
                let Some(id) = args.get("id").and_then(|v| v.as_str()).and_then(|s| Uuid::parse_str(s).ok()) else {
                    return error_value("missing or invalid 'id' field");
                };
                match ctx.store.list_workflow_steps(id).await {
                    Ok(steps) => serde_json::json!({"rows": steps}),
                    Err(e) => error_value(format!("query failed: {e}")),
                }
            }
            other => error_value(format!("unknown resource '{other}'")),
        }
    }
}
