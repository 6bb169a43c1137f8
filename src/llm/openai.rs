//! OpenAI streaming service.
//!
//! Tool-call arguments arrive as incremental JSON string fragments spread
//! across delta chunks. The service buffers fragments per tool-call index
//! and emits one FunctionCall per call once the stream reports a finish
//! reason; a fragment set that never parses is an `InvalidToolCallError`.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use super::retry::{send_with_retry, RetryPolicy};
use super::{FinishReason, LlmRequest, LlmService, StreamEvent, Usage};
use crate::error::{DbRheoError, Result};
use crate::types::{AbortSignal, Content, Part, Role};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI LLM service.
pub struct OpenAiService {
    model: String,
    api_key: String,
    base_url: String,
    client: Client,
    retry: RetryPolicy,
}

impl OpenAiService {
    /// Creates a service for the given model.
    pub fn new(
        model: impl Into<String>,
        api_key: impl Into<String>,
        base_url: Option<String>,
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
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
            retry,
        })
    }

    fn request_body(&self, request: &LlmRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": convert_messages(request),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(temperature) = request.generation.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max) = request.generation.max_output_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(request
                .tools
                .iter()
                .map(|t| serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                }))
                .collect::<Vec<_>>());
        }
        body
    }
}

/// Converts core contents into OpenAI chat messages. Function-role
/// contents expand into one `tool` message per response part.
fn convert_messages(request: &LlmRequest) -> Vec<serde_json::Value> {
    let mut messages = Vec::new();
    if let Some(system) = &request.system_instruction {
        messages.push(serde_json::json!({ "role": "system", "content": system }));
    }
    for content in &request.history {
        match content.role {
            Role::User => {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": content.joined_text(),
                }));
            }
            Role::Model => {
                let text = content.joined_text();
                let tool_calls: Vec<serde_json::Value> = content
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        Part::FunctionCall { id, name, args } => Some(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": args.to_string(),
                            }
                        })),
                        _ => None,
                    })
                    .collect();

                let mut message = serde_json::json!({ "role": "assistant" });
                message["content"] = if text.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::json!(text)
                };
                if !tool_calls.is_empty() {
                    message["tool_calls"] = serde_json::json!(tool_calls);
                }
                messages.push(message);
            }
            Role::Function => {
                for part in &content.parts {
                    if let Part::FunctionResponse { id, response, .. } = part {
                        messages.push(serde_json::json!({
                            "role": "tool",
                            "tool_call_id": id,
                            "content": response.to_string(),
                        }));
                    }
                }
            }
        }
    }
    messages
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    delta: WireDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WireDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Default, Clone)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct StreamState {
    partial_calls: Vec<PartialCall>,
    finish_reason: Option<String>,
    flushed: bool,
}

fn parse_chunk(state: &mut StreamState, data: &str) -> Result<Vec<StreamEvent>> {
    if data.trim() == "[DONE]" {
        return flush_finish(state);
    }

    let chunk: WireChunk = serde_json::from_str(data)
        .map_err(|e| DbRheoError::llm_protocol(format!("Bad OpenAI chunk: {e}")))?;

    let mut events = Vec::new();

    if let Some(usage) = chunk.usage {
        events.push(StreamEvent::UsageUpdate(Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cached_tokens: None,
        }));
    }

    for choice in &chunk.choices {
        if let Some(text) = &choice.delta.content {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta(text.clone()));
            }
        }

        for delta in &choice.delta.tool_calls {
            if state.partial_calls.len() <= delta.index {
                state
                    .partial_calls
                    .resize(delta.index + 1, PartialCall::default());
            }
            let partial = &mut state.partial_calls[delta.index];
            if let Some(id) = &delta.id {
                partial.id = id.clone();
            }
            if let Some(function) = &delta.function {
                if let Some(name) = &function.name {
                    partial.name.push_str(name);
                }
                if let Some(arguments) = &function.arguments {
                    partial.arguments.push_str(arguments);
                }
            }
        }

        if let Some(reason) = &choice.finish_reason {
            state.finish_reason = Some(reason.clone());
        }
    }

    Ok(events)
}

/// Emits the buffered FunctionCalls followed by the Finish event. Called
/// once, at the `[DONE]` sentinel or stream end.
fn flush_finish(state: &mut StreamState) -> Result<Vec<StreamEvent>> {
    if state.flushed {
        return Ok(Vec::new());
    }
    state.flushed = true;

    let mut events = Vec::new();
    for (index, partial) in state.partial_calls.drain(..).enumerate() {
        let args: serde_json::Value = if partial.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&partial.arguments).map_err(|e| {
                DbRheoError::invalid_tool_call(format!(
                    "arguments for tool call '{}' never became valid JSON: {e}",
                    partial.name
                ))
            })?
        };
        let id = if partial.id.is_empty() {
            format!("call_{index}")
        } else {
            partial.id
        };
        events.push(StreamEvent::FunctionCall {
            id,
            name: partial.name,
            args,
        });
    }

    let reason = match state.finish_reason.as_deref() {
        Some("stop") | Some("tool_calls") | None => FinishReason::Stop,
        Some("length") => FinishReason::MaxTokens,
        _ => FinishReason::Unspecified,
    };
    events.push(StreamEvent::Finish(reason));
    Ok(events)
}

#[async_trait]
impl LlmService for OpenAiService {
    async fn stream(
        &self,
        request: LlmRequest,
        signal: AbortSignal,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(&request);

        let response = send_with_retry(&self.retry, || {
            self.client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
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

    async fn count_tokens(&self, _contents: &[Content]) -> Result<Option<u64>> {
        // No token-counting endpoint; callers fall back to the estimator.
        Ok(None)
    }

    fn supports_function_calling(&self) -> bool {
        true
    }

    fn model(&self) -> &str {
        &self.model
    }
}
