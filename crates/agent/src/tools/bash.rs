//! Runs a single command via an argv vector, never a shell. Deliberately
//! narrower than an interactive shell: no pipes, no interpolation, a
//! hard timeout, and the job's `working_dir` as the only allowed cwd.

use std::time::Duration;

use async_trait::async_trait;
use loom_core::model::Tool;
use tokio::process::Command;
use tokio::time::timeout;

use super::{declaration_for, error_value, object_schema, ToolContext, ToolImpl};
use crate::llm_client::ToolDeclaration;

const BASH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BashTool;

#[async_trait]
impl ToolImpl for BashTool {
    fn declaration(&self, tool: &Tool) -> ToolDeclaration {
        declaration_for(
            tool,
            object_schema(
                &["command"],
                serde_json::json!({
                    "command": {"type": "array", "items": {"type": "string"}, "description": "argv, e.g. [\"ls\", \"-la\"]"},
                }),
            ),
        )
    }

    async fn call(&self, _tool: &Tool, ctx: &ToolContext, args: serde_json::Value) -> serde_json::Value {
        let Some(argv) = args.get("command").and_then(|v| v.as_array()) else {
            return error_value("missing required 'command' field (argv array)");
        };
        let argv: Vec<&str> = argv.iter().filter_map(|v| v.as_str()).collect();
        let Some((program, rest)) = argv.split_first() else {
            return error_value("'command' must contain at least one element");
        };

        let mut cmd = Command::new(program);
        cmd.args(rest);
        if let Some(dir) = &ctx.working_dir {
            cmd.current_dir(dir);
        }

        match timeout(BASH_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => serde_json::json!({
                "exit_code": output.status.code(),
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
            }),
            Ok(Err(e)) => error_value(format!("failed to spawn '{program}': {e}")),
            Err(_) => error_value(format!("command timed out after {:?}", BASH_TIMEOUT)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use loom_core::model::ToolType;
    use uuid::Uuid;

    use super::*;
    use crate::tools::ToolContext;

    fn tool() -> Tool {
        Tool {
            id: Uuid::new_v4(),
            name: "bash".to_string(),
            description: "run a command".to_string(),
            tool_type: ToolType::Bash,
            metadata: serde_json::json!({}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            agent_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            working_dir: None,
            store: Arc::new(crate::tests_support::NoopStore),
        }
    }

    #[tokio::test]
    async fn runs_a_simple_command() {
        let got = BashTool
            .call(&tool(), &ctx(), serde_json::json!({"command": ["echo", "hi"]}))
            .await;
        assert_eq!(got["exit_code"], 0);
        assert_eq!(got["stdout"].as_str().unwrap().trim(), "hi");
    }

    #[tokio::test]
    async fn empty_argv_reports_error() {
        let got = BashTool.call(&tool(), &ctx(), serde_json::json!({"command": []})).await;
        assert!(got.get("error").is_some());
    }

    #[tokio::test]
    async fn missing_binary_reports_error_without_panicking() {
        let got = BashTool
            .call(&tool(), &ctx(), serde_json::json!({"command": ["definitely-not-a-real-binary-xyz"]}))
            .await;
        assert!(got.get("error").is_some());
    }
}
