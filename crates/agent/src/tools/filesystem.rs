//! Scoped filesystem access under the job's `working_dir`. Path
//! canonicalization and boundary checks are grounded in the sandbox's
//! symlink-escape guard: resolve the requested path, then require the
//! canonical form still live under the canonical root.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use loom_core::model::Tool;
use tokio::fs;

use super::{declaration_for, error_value, object_schema, ToolContext, ToolImpl};
use crate::llm_client::ToolDeclaration;

pub struct FilesystemTool;

fn resolve_within(root: &Path, requested: &str) -> Result<PathBuf, String> {
    let root_canonical = root
        .canonicalize()
        .map_err(|e| format!("sandbox root {} is not accessible: {e}", root.display()))?;

    let candidate = root_canonical.join(requested.trim_start_matches('/'));

    // The leaf may not exist yet for a write; canonicalize the parent
    // and re-append the leaf so the escape check still applies.
    let (to_check, leaf) = if candidate.exists() {
        (candidate.clone(), None)
    } else {
        let parent = candidate.parent().unwrap_or(&root_canonical).to_path_buf();
        (parent, candidate.file_name().map(|n| n.to_owned()))
    };

    let canonical = to_check
        .canonicalize()
        .map_err(|e| format!("path '{requested}' does not resolve: {e}"))?;

    if !canonical.starts_with(&root_canonical) {
        return Err(format!("path '{requested}' escapes the sandbox root"));
    }

    Ok(match leaf {
        Some(name) => canonical.join(name),
        None => canonical,
    })
}

#[async_trait]
impl ToolImpl for FilesystemTool {
    fn declaration(&self, tool: &Tool) -> ToolDeclaration {
        declaration_for(
            tool,
            object_schema(
                &["action", "path"],
                serde_json::json!({
                    "action": {"type": "string", "enum": ["read", "write", "list"]},
                    "path": {"type": "string"},
                    "content": {"type": "string", "description": "file content, required for action=write"},
                }),
            ),
        )
    }

    async fn call(&self, _tool: &Tool, ctx: &ToolContext, args: serde_json::Value) -> serde_json::Value {
        let Some(root) = ctx.working_dir.as_deref() else {
            return error_value("no working_dir is granted to this job; filesystem tool is unavailable");
        };
        let root = Path::new(root);

        let Some(action) = args.get("action").and_then(|v| v.as_str()) else {
            return error_value("missing required 'action' field");
        };
        let Some(requested) = args.get("path").and_then(|v| v.as_str()) else {
            return error_value("missing required 'path' field");
        };

        match action {
            "read" => match resolve_within(root, requested) {
                Ok(path) => match fs::read_to_string(&path).await {
                    Ok(content) => serde_json::json!({"content": content}),
                    Err(e) => error_value(format!("failed to read '{requested}': {e}")),
                },
                Err(e) => error_value(e),
            },
            "write" => {
                let Some(content) = args.get("content").and_then(|v| v.as_str()) else {
                    return error_value("missing required 'content' field for action=write");
                };
                match resolve_within(root, requested) {
                    Ok(path) => match fs::write(&path, content).await {
                        Ok(()) => serde_json::json!({"ok": true}),
                        Err(e) => error_value(format!("failed to write '{requested}': {e}")),
                    },
                    Err(e) => error_value(e),
                }
            }
            "list" => match resolve_within(root, requested) {
                Ok(path) => {
                    let mut entries = Vec::new();
                    let mut dir = match fs::read_dir(&path).await {
                        Ok(d) => d,
                        Err(e) => return error_value(format!("failed to list '{requested}': {e}")),
                    };
                    loop {
                        match dir.next_entry().await {
                            Ok(Some(entry)) => entries.push(entry.file_name().to_string_lossy().into_owned()),
                            Ok(None) => break,
                            Err(e) => return error_value(format!("failed to list '{requested}': {e}")),
                        }
                    }
                    serde_json::json!({"entries": entries})
                }
                Err(e) => error_value(e),
            },
            other => error_value(format!("unknown action '{other}'")),
        }
    }
}
