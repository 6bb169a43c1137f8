//! Gemini streaming service.
//!
//! Gemini's wire format maps 1:1 onto the core content model: parts are
//! text, functionCall, or functionResponse objects, and function-call
//! arguments arrive as structured JSON. Gemini does not assign call ids,
//! so the service synthesizes `<name>-<n>` ids that stay stable within a
//! stream.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use super::retry::{send_with_retry, RetryPolicy};
use super::{FinishReason, GenerationConfig, LlmRequest, LlmService, StreamEvent, Usage};
use crate::error::{DbRheoError, Result};
use crate::types::{AbortSignal, Content, Part};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini LLM service.
pub struct GeminiService {
    model: String,
    api_key: String,
    base_url: String,
    client: Client,
    retry: RetryPolicy,
}

impl GeminiService {
    /// Creates a service for the given model.
    pub fn new(
        model: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DbRheoError::llm_transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            model: model.into(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
            retry,
        })
    }

    /// Overrides the API base URL (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request_body(&self, request: &LlmRequest) -> serde_json::Value {
        let contents: Vec<serde_json::Value> =
            request.history.iter().map(content_to_wire).collect();

        let mut body = serde_json::json!({ "contents": contents });

        if let Some(system) = &request.system_instruction {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!([{
                "functionDeclarations": request.tools.iter().map(|t| serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })).collect::<Vec<_>>()
            }]);
        }
        let generation = generation_to_wire(&request.generation);
        if !generation.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            body["generationConfig"] = generation;
        }
        body
    }
}

/// Maps a core content onto the Gemini wire shape.
pub(crate) fn content_to_wire(content: &Content) -> serde_json::Value {
    let parts: Vec<serde_json::Value> = content
        .parts
        .iter()
        .map(|part| match part {
            Part::Text { text } => serde_json::json!({ "text": text }),
            Part::FunctionCall { name, args, .. } => serde_json::json!({
                "functionCall": { "name": name, "args": args }
            }),
            Part::FunctionResponse { name, response, .. } => serde_json::json!({
                "functionResponse": { "name": name, "response": response }
            }),
        })
        .collect();
    serde_json::json!({ "role": content.role.as_str(), "parts": parts })
}

/// Maps a Gemini wire content back into the core model. Inverse of
/// [`content_to_wire`] up to synthesized call ids.
pub(crate) fn content_from_wire(value: &serde_json::Value) -> Result<Content> {
    let role = match value.get("role").and_then(|r| r.as_str()) {
        Some("user") => crate::types::Role::User,
        Some("model") => crate::types::Role::Model,
        Some("function") => crate::types::Role::Function,
        other => {
            return Err(DbRheoError::llm_protocol(format!(
                "Unknown content role: {other:?}"
            )))
        }
    };
    let mut parts = Vec::new();
    let mut call_index = 0usize;
    for part in value
        .get("parts")
        .and_then(|p| p.as_array())
        .into_iter()
        .flatten()
    {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            parts.push(Part::text(text));
        } else if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default();
            parts.push(Part::function_call(
                format!("{name}-{call_index}"),
                name,
                call.get("args").cloned().unwrap_or(serde_json::json!({})),
            ));
            call_index += 1;
        } else if let Some(response) = part.get("functionResponse") {
            let name = response
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default();
            parts.push(Part::function_response(
                format!("{name}-{call_index}"),
                name,
                response
                    .get("response")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            ));
            call_index += 1;
        }
    }
    Ok(Content::new(role, parts))
}

fn generation_to_wire(generation: &GenerationConfig) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    if let Some(temperature) = generation.temperature {
        out.insert("temperature".to_string(), serde_json::json!(temperature));
    }
    if let Some(max) = generation.max_output_tokens {
        out.insert("maxOutputTokens".to_string(), serde_json::json!(max));
    }
    serde_json::Value::Object(out)
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    content: Option<serde_json::Value>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
    #[serde(rename = "cachedContentTokenCount")]
    cached_content_token_count: Option<u64>,
}

#[derive(Debug, Default)]
struct StreamState {
    call_index: usize,
}

fn parse_chunk(state: &mut StreamState, data: &str) -> Result<Vec<StreamEvent>> {
    let chunk: WireChunk = serde_json::from_str(data)
        .map_err(|e| DbRheoError::llm_protocol(format!("Bad Gemini chunk: {e}")))?;

    let mut events = Vec::new();

    if let Some(usage) = chunk.usage_metadata {
        events.push(StreamEvent::UsageUpdate(Usage {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            cached_tokens: usage.cached_content_token_count,
        }));
    }

    for candidate in &chunk.candidates {
        if let Some(content) = &candidate.content {
            for part in content
                .get("parts")
                .and_then(|p| p.as_array())
                .into_iter()
                .flatten()
            {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        events.push(StreamEvent::TextDelta(text.to_string()));
                    }
                } else if let Some(call) = part.get("functionCall") {
                    let name = call
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let id = format!("{name}-{}", state.call_index);
                    state.call_index += 1;
                    events.push(StreamEvent::FunctionCall {
                        id,
                        name,
                        args: call.get("args").cloned().unwrap_or(serde_json::json!({})),
                    });
                }
            }
        }
        if let Some(reason) = &candidate.finish_reason {
            events.push(StreamEvent::Finish(map_finish_reason(reason)));
        }
    }

    Ok(events)
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::MaxTokens,
        _ => FinishReason::Unspecified,
    }
}

#[async_trait]
impl LlmService for GeminiService {
    async fn stream(
        &self,
        request: LlmRequest,
        signal: AbortSignal,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        let body = self.request_body(&request);

        let response = send_with_retry(&self.retry, || {
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
        })
        .await?;

        let mut state = StreamState::default();
        let events = response
            .bytes_stream()
            .eventsource()
            .map(move |event| match event {
                Ok(event) => parse_chunk(&mut state, &event.data),
                Err(e) => Err(DbRheoError::llm_transport(format!("Stream error: {e}"))),
            })
            .flat_map(|result| {
                futures::stream::iter(match result {
                    Ok(events) => events.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                })
            })
            .take_until(signal.tripped_owned());

        Ok(events.boxed())
    }

    async fn count_tokens(&self, contents: &[Content]) -> Result<Option<u64>> {
        let url = format!("{}/models/{}:countTokens", self.base_url, self.model);
        let body = serde_json::json!({
            "contents": contents.iter().map(content_to_wire).collect::<Vec<_>>(),
        });

        let response = send_with_retry(&self.retry, || {
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
        })
        .await?;

        #[derive(Deserialize)]
        struct CountResponse {
            #[serde(rename = "totalTokens")]
            total_tokens: u64,
        }
        let parsed: CountResponse = response
            .json()
            .await
            .map_err(|e| DbRheoError::llm_protocol(format!("Bad count response: {e}")))?;
        Ok(Some(parsed.total_tokens))
    }

    fn supports_function_calling(&self) -> bool {
        true
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn service() -> GeminiService {
        GeminiService::new(
            "gemini-2.0-flash",
            "test-key",
            Duration::from_secs(30),
            RetryPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_content_wire_round_trip() {
        let content = Content::model(vec![
            Part::text("Looking that up."),
            Part::function_call(
                "sql_tool-0",
                "sql_tool",
                serde_json::json!({"sql": "SELECT 1"}),
            ),
        ]);
        let wire = content_to_wire(&content);
        let back = content_from_wire(&wire).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn test_function_role_round_trip() {
        let content = Content::function(vec![Part::function_response(
            "sql_tool-0",
            "sql_tool",
            serde_json::json!({"rows": [[1]]}),
        )]);
        let wire = content_to_wire(&content);
        let back = content_from_wire(&wire).unwrap();
        assert_eq!(back.role, Role::Function);
        assert_eq!(back, content);
    }

    #[test]
    fn test_request_body_shape() {
        let service = service();
        let request = LlmRequest {
            history: vec![Content::user_text("hello")],
            system_instruction: Some("be terse".to_string()),
            tools: vec![crate::tools::ToolDeclaration {
                name: "sql_tool".to_string(),
                description: "run sql".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }],
            generation: GenerationConfig {
                temperature: Some(0.2),
                max_output_tokens: Some(512),
            },
        };
        let body = service.request_body(&request);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "sql_tool"
        );
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 512);
    }

    #[test]
    fn test_parse_text_chunk() {
        let mut state = StreamState::default();
        let events = parse_chunk(
            &mut state,
            r#"{"candidates":[{"content":{"parts":[{"text":"Hello"}]}}]}"#,
        )
        .unwrap();
        assert!(matches!(&events[0], StreamEvent::TextDelta(t) if t == "Hello"));
    }

    #[test]
    fn test_parse_function_call_chunk_synthesizes_ids() {
        let mut state = StreamState::default();
        let chunk = r#"{"candidates":[{"content":{"parts":[
            {"functionCall":{"name":"sql_tool","args":{"sql":"SELECT 1"}}},
            {"functionCall":{"name":"sql_tool","args":{"sql":"SELECT 2"}}}
        ]}}]}"#;
        let events = parse_chunk(&mut state, chunk).unwrap();
        let ids: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::FunctionCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["sql_tool-0", "sql_tool-1"]);
    }

    #[test]
    fn test_parse_finish_and_usage() {
        let mut state = StreamState::default();
        let chunk = r#"{"candidates":[{"content":{"parts":[]},"finishReason":"STOP"}],
            "usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":5}}"#;
        let events = parse_chunk(&mut state, chunk).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::UsageUpdate(Usage { input_tokens: 10, output_tokens: 5, .. })
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Finish(FinishReason::Stop))));
    }

    #[test]
    fn test_bad_chunk_is_protocol_error() {
        let mut state = StreamState::default();
        let err = parse_chunk(&mut state, "not json").unwrap_err();
        assert_eq!(err.kind(), "LLMProtocolError");
    }
}
