//! Scoped key/value store, one namespace per agent. Grounded in the
//! teacher's `memory.rs` pool (an `RwLock`-guarded map behind a small
//! get/set/evict API), simplified to plain get/set/list/delete with no
//! TTL or pool-size accounting — no RAG, per the non-goal this spec
//! carries forward from the teacher's broader memory subsystem.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use loom_core::model::Tool;
use uuid::Uuid;

use super::{declaration_for, error_value, object_schema, ToolContext, ToolImpl};
use crate::llm_client::ToolDeclaration;

#[derive(Debug, Default)]
pub struct MemoryTool {
    store: RwLock<HashMap<Uuid, HashMap<String, serde_json::Value>>>,
}

impl MemoryTool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ToolImpl for MemoryTool {
    fn declaration(&self, tool: &Tool) -> ToolDeclaration {
        declaration_for(
            tool,
            object_schema(
                &["action", "key"],
                serde_json::json!({
                    "action": {"type": "string", "enum": ["get", "set", "list", "delete"]},
                    "key": {"type": "string"},
                    "value": {"description": "value to store, required for action=set"},
                }),
            ),
        )
    }

    async fn call(&self, _tool: &Tool, ctx: &ToolContext, args: serde_json::Value) -> serde_json::Value {
        let Some(action) = args.get("action").and_then(|v| v.as_str()) else {
            return error_value("missing required 'action' field");
        };

        match action {
            "get" => {
                let Some(key) = args.get("key").and_then(|v| v.as_str()) else {
                    return error_value("missing required 'key' field");
                };
                let guard = self.store.read();
                let value = guard
                    .get(&ctx.agent_id)
                    .and_then(|ns| ns.get(key))
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                serde_json::json!({"value": value})
            }
            "set" => {
                let Some(key) = args.get("key").and_then(|v| v.as_str()) else {
                    return error_value("missing required 'key' field");
                };
                let Some(value) = args.get("value") else {
                    return error_value("missing required 'value' field for action=set");
                };
                let mut guard = self.store.write();
                guard
                    .entry(ctx.agent_id)
                    .or_default()
                    .insert(key.to_string(), value.clone());
                serde_json::json!({"ok": true})
            }
            "list" => {
                let guard = self.store.read();
                let keys: Vec<&String> = guard
                    .get(&ctx.agent_id)
                    .map(|ns| ns.keys().collect())
                    .unwrap_or_default();
                serde_json::json!({"keys": keys})
            }
            "delete" => {
                let Some(key) = args.get("key").and_then(|v| v.as_str()) else {
                    return error_value("missing required 'key' field");
                };
                let mut guard = self.store.write();
                let removed = guard
                    .get_mut(&ctx.agent_id)
                    .map(|ns| ns.remove(key).is_some())
                    .unwrap_or(false);
                serde_json::json!({"removed": removed})
            }
            other => error_value(format!("unknown action '{other}'")),
        }
    }
}
