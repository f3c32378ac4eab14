//! The five built-in tool capabilities selected by `Tool::tool_type`.
//! Each is a narrow, deliberately non-general-purpose capability (no
//! RAG in `memory`, no arbitrary SQL in `database`, no shell in
//! `bash`) — the built-ins are meant to cover common agent needs, not
//! to reopen the sandbox boundary the WASM executor enforces elsewhere.
//!
//! A tool call that fails internally (bad args, network error, path
//! escape) returns `{"error": "..."}` to the model rather than failing
//! the containing job step.

pub mod bash;
pub mod database;
pub mod filesystem;
pub mod http;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use loom_core::model::{Tool, ToolType};
use loom_store::PrimitiveStore;
use uuid::Uuid;

use crate::llm_client::{ToolFunctionDeclaration, ToolDeclaration};

/// Runtime context a built-in tool needs to execute a single call.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: Uuid,
    pub job_id: Uuid,
    pub working_dir: Option<String>,
    pub store: Arc<dyn PrimitiveStore>,
}

/// A built-in tool capability. Implementations never propagate errors
/// out of `call` — internal failures are encoded in the returned JSON.
#[async_trait]
pub trait ToolImpl: Send + Sync {
    fn declaration(&self, tool: &Tool) -> ToolDeclaration;

    async fn call(&self, tool: &Tool, ctx: &ToolContext, args: serde_json::Value) -> serde_json::Value;
}

/// Resolve the built-in implementation for a tool's `tool_type`.
#[must_use]
pub fn resolve(tool_type: ToolType) -> Arc<dyn ToolImpl> {
    match tool_type {
        ToolType::Memory => Arc::new(memory::MemoryTool::new()),
        ToolType::Filesystem => Arc::new(filesystem::FilesystemTool),
        ToolType::Http => Arc::new(http::HttpTool::new()),
        ToolType::Database => Arc::new(database::DatabaseTool),
        ToolType::Bash => Arc::new(bash::BashTool),
    }
}

/// Build the generic "string-keyed JSON args" parameter schema shared
/// by every built-in, parameterized by the named properties each tool
/// actually accepts.
#[must_use]
pub fn object_schema(required: &[&str], properties: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

pub(crate) fn error_value(message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({ "error": message.into() })
}

pub(crate) fn declaration_for(tool: &Tool, parameters: serde_json::Value) -> ToolDeclaration {
    ToolDeclaration {
        decl_type: "function".to_string(),
        function: ToolFunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters,
        },
    }
}
