//! HTTP GET/POST honoring the tool's configured allow-list, the same
//! allow-list convention the WASM executor applies to `http_request`
//! — grounded in `llm_client`'s `reqwest::Client` usage.

use std::time::Duration;

use async_trait::async_trait;
use loom_core::model::Tool;
use reqwest::Client;

use super::{declaration_for, error_value, object_schema, ToolContext, ToolImpl};
use crate::llm_client::ToolDeclaration;

pub struct HttpTool {
    client: Client,
}

impl HttpTool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpTool {
    fn default() -> Self {
        Self::new()
    }
}

fn allowed_prefixes(tool: &Tool) -> Vec<String> {
    tool.metadata
        .get("allowed_url_prefixes")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn is_allowed(url: &str, prefixes: &[String]) -> bool {
    if prefixes.is_empty() {
        return false;
    }
    prefixes.iter().any(|p| url.starts_with(p.as_str()))
}

#[async_trait]
impl ToolImpl for HttpTool {
    fn declaration(&self, tool: &Tool) -> ToolDeclaration {
        declaration_for(
            tool,
            object_schema(
                &["method", "url"],
                serde_json::json!({
                    "method": {"type": "string", "enum": ["GET", "POST"]},
                    "url": {"type": "string"},
                    "body": {"type": "string", "description": "request body, used for POST"},
                }),
            ),
        )
    }

    async fn call(&self, tool: &Tool, _ctx: &ToolContext, args: serde_json::Value) -> serde_json::Value {
        let Some(url) = args.get("url").and_then(|v| v.as_str()) else {
            return error_value("missing required 'url' field");
        };
        let method = args
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();

        let prefixes = allowed_prefixes(tool);
        if !is_allowed(url, &prefixes) {
            return error_value(format!("url '{url}' is not in this tool's allow-list"));
        }

        let request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => {
                let body = args.get("body").and_then(|v| v.as_str()).unwrap_or("").to_string();
                self.client.post(url).body(body)
            }
            other => return error_value(format!("unsupported method '{other}'")),
        };

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.text().await {
                    Ok(body) => serde_json::json!({"status": status, "body": body}),
                    Err(e) => error_value(format!("failed to read response body: {e}")),
                }
            }
            Err(e) => error_value(format!("request failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_rejects_urls_outside_configured_prefixes() {
        let prefixes = vec!["https://api.example.com/".to_string()];
        assert!(is_allowed("https://api.example.com/widgets", &prefixes));
        assert!(!is_allowed("https://evil.example.org/", &prefixes));
    }

    #[test]
    fn empty_allow_list_rejects_everything() {
        assert!(!is_allowed("https://api.example.com/", &[]));
    }
}
