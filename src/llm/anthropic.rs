//! Anthropic streaming service.
//!
//! Content blocks are concatenated into the core part model: `text` blocks
//! stream as deltas, `tool_use` blocks accumulate their input JSON and
//! emit one FunctionCall when the block closes, and function-role contents
//! are serialized back as `tool_result` blocks on user messages.

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

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Anthropic API version header.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default generation budget when the request does not set one.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic LLM service.
pub struct AnthropicService {
    model: String,
    api_key: String,
    base_url: String,
    client: Client,
    retry: RetryPolicy,
}

impl AnthropicService {
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

    fn request_body(&self, request: &LlmRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.generation.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": convert_messages(&request.history),
            "stream": stream,
        });
        if let Some(system) = &request.system_instruction {
            body["system"] = serde_json::json!(system);
        }
        if let Some(temperature) = request.generation.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(request
                .tools
                .iter()
                .map(|t| serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                }))
                .collect::<Vec<_>>());
        }
        body
    }
}

/// Converts core contents into Anthropic messages. Model contents become
/// assistant messages with text and tool_use blocks; function contents
/// become user messages carrying tool_result blocks.
fn convert_messages(history: &[Content]) -> Vec<serde_json::Value> {
    history
        .iter()
        .map(|content| match content.role {
            Role::User => serde_json::json!({
                "role": "user",
                "content": [{ "type": "text", "text": content.joined_text() }],
            }),
            Role::Model => {
                let blocks: Vec<serde_json::Value> = content
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        Part::Text { text } => {
                            Some(serde_json::json!({ "type": "text", "text": text }))
                        }
                        Part::FunctionCall { id, name, args } => Some(serde_json::json!({
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": args,
                        })),
                        Part::FunctionResponse { .. } => None,
                    })
                    .collect();
                serde_json::json!({ "role": "assistant", "content": blocks })
            }
            Role::Function => {
                let blocks: Vec<serde_json::Value> = content
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        Part::FunctionResponse { id, response, .. } => {
                            Some(serde_json::json!({
                                "type": "tool_result",
                                "tool_use_id": id,
                                "content": response.to_string(),
                            }))
                        }
                        _ => None,
                    })
                    .collect();
                serde_json::json!({ "role": "user", "content": blocks })
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    index: usize,
    content_block: Option<WireContentBlock>,
    delta: Option<WireDelta>,
    usage: Option<WireUsage>,
    message: Option<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
    partial_json: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    usage: Option<WireUsage>,
}

#[derive(Debug, Default)]
struct StreamState {
    /// Open tool_use block, keyed by content-block index.
    open_tool: Option<(usize, String, String, String)>,
    input_tokens: u64,
    stop_reason: Option<String>,
}

fn parse_event(state: &mut StreamState, data: &str) -> Result<Vec<StreamEvent>> {
    let event: WireEvent = serde_json::from_str(data)
        .map_err(|e| DbRheoError::llm_protocol(format!("Bad Anthropic event: {e}")))?;

    let mut events = Vec::new();
    match event.event_type.as_str() {
        "message_start" => {
            if let Some(usage) = event.message.and_then(|m| m.usage) {
                state.input_tokens = usage.input_tokens;
                events.push(StreamEvent::UsageUpdate(Usage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    cached_tokens: None,
                }));
            }
        }
        "content_block_start" => {
            if let Some(block) = event.content_block {
                if block.block_type == "tool_use" {
                    state.open_tool = Some((
                        event.index,
                        block.id.unwrap_or_default(),
                        block.name.unwrap_or_default(),
                        String::new(),
                    ));
                }
            }
        }
        "content_block_delta" => {
            if let Some(delta) = event.delta {
                match delta.delta_type.as_deref() {
                    Some("text_delta") => {
                        if let Some(text) = delta.text {
                            events.push(StreamEvent::TextDelta(text));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some((_, _, _, buffer)) = state.open_tool.as_mut() {
                            buffer.push_str(delta.partial_json.as_deref().unwrap_or(""));
                        }
                    }
                    _ => {}
                }
            }
        }
        "content_block_stop" => {
            if let Some((index, id, name, buffer)) = state.open_tool.take() {
                if index == event.index {
                    let args = if buffer.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&buffer).map_err(|e| {
                            DbRheoError::invalid_tool_call(format!(
                                "tool_use input for '{name}' is not valid JSON: {e}"
                            ))
                        })?
                    };
                    events.push(StreamEvent::FunctionCall { id, name, args });
                } else {
                    state.open_tool = Some((index, id, name, buffer));
                }
            }
        }
        "message_delta" => {
            if let Some(delta) = &event.delta {
                if let Some(reason) = &delta.stop_reason {
                    state.stop_reason = Some(reason.clone());
                }
            }
            if let Some(usage) = event.usage {
                events.push(StreamEvent::UsageUpdate(Usage {
                    input_tokens: state.input_tokens,
                    output_tokens: usage.output_tokens,
                    cached_tokens: None,
                }));
            }
        }
        "message_stop" => {
            events.push(StreamEvent::Finish(map_stop_reason(
                state.stop_reason.as_deref(),
            )));
        }
        // ping, error passthrough and anything new are ignored.
        _ => {}
    }

    Ok(events)
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        // tool_use still means the model finished its turn cleanly.
        Some("end_turn") | Some("tool_use") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::MaxTokens,
        None => FinishReason::Stop,
        _ => FinishReason::Unspecified,
    }
}

#[async_trait]
impl LlmService for AnthropicService {
    async fn stream(
        &self,
        request: LlmRequest,
        signal: AbortSignal,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/messages", self.base_url);
        let body = self.request_body(&request, true);

        let response = send_with_retry(&self.retry, || {
            self.client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
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
                Ok(event) => parse_event(&mut state, &event.data),
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
        let url = format!("{}/messages/count_tokens", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": convert_messages(contents),
        });

        let response = send_with_retry(&self.retry, || {
            self.client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
        })
        .await?;

        #[derive(Deserialize)]
        struct CountResponse {
            input_tokens: u64,
        }
        let parsed: CountResponse = response
            .json()
            .await
            .map_err(|e| DbRheoError::llm_protocol(format!("Bad count response: {e}")))?;
        Ok(Some(parsed.input_tokens))
    }

    fn supports_function_calling(&self) -> bool {
        true
    }

    fn model(&self) -> &str {
        &self.model
    }
}
