//! HTTP fetch tool.

use std::time::Duration;

use async_trait::async_trait;

use super::{require_str, Capability, Tool, ToolContext, ToolOutput};
use crate::error::{DbRheoError, Result};
use crate::types::AbortSignal;

const CAPABILITIES: &[Capability] = &[Capability::Read];

/// Fetches a URL and returns the (size-capped) response body.
pub struct HttpTool;

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        "http_tool"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP. Supports GET and POST with an optional JSON \
         body; the response body is returned truncated at the configured \
         size cap."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch"
                },
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST"],
                    "description": "HTTP method (default: GET)"
                },
                "body": {
                    "type": "object",
                    "description": "JSON body for POST requests"
                }
            },
            "required": ["url"]
        })
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn validate_args(&self, args: &serde_json::Value) -> Result<()> {
        let url = require_str(args, "url")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(DbRheoError::invalid_tool_call(format!(
                "'{url}' is not an http(s) URL"
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
        signal: &AbortSignal,
    ) -> Result<ToolOutput> {
        self.validate_args(args)?;
        let url = require_str(args, "url")?;
        let method = args
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let max_bytes = ctx.config.get_u64("tools.http_max_bytes", 262_144) as usize;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DbRheoError::tool_execution(format!("HTTP client: {e}")))?;

        let request = match method.as_str() {
            "GET" => client.get(url),
            "POST" => {
                let body = args.get("body").cloned().unwrap_or(serde_json::json!({}));
                client.post(url).json(&body)
            }
            other => {
                return Err(DbRheoError::invalid_tool_call(format!(
                    "Unsupported method '{other}'"
                )))
            }
        };

        let response = tokio::select! {
            response = request.send() => response
                .map_err(|e| DbRheoError::tool_execution(format!("Request failed: {e}")))?,
            _ = signal.tripped() => return Err(DbRheoError::Cancelled),
        };

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DbRheoError::tool_execution(format!("Cannot read response: {e}")))?;
        let truncated = bytes.len() > max_bytes;
        let body = String::from_utf8_lossy(&bytes[..bytes.len().min(max_bytes)]).into_owned();

        Ok(ToolOutput::new(
            serde_json::json!({
                "url": url,
                "status": status,
                "body": body,
                "bytes": bytes.len(),
                "truncated": truncated,
            }),
            format!("{method} {url} -> {status}"),
        ))
    }
}
