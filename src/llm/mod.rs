//! LLM service abstraction.
//!
//! Normalizes the Gemini, Anthropic, and OpenAI streaming protocols into
//! one event stream: text deltas, function calls, usage updates, and a
//! finish marker. Providers are selected by model-name prefix through the
//! factory.

pub mod anthropic;
pub mod factory;
pub mod gemini;
pub mod mock;
pub mod openai;
pub mod retry;

pub use anthropic::AnthropicService;
pub use factory::{create_service, provider_for_model, Provider};
pub use gemini::GeminiService;
pub use mock::MockLlmService;
pub use openai::OpenAiService;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::tools::ToolDeclaration;
use crate::types::{AbortSignal, Content, Part};

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model stopped naturally (including after emitting tool calls).
    Stop,
    /// Output token budget exhausted.
    MaxTokens,
    /// The abort signal tripped mid-stream.
    Aborted,
    /// The provider reported something else.
    Unspecified,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::MaxTokens => "max_tokens",
            Self::Aborted => "aborted",
            Self::Unspecified => "unspecified",
        }
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: Option<u64>,
}

/// One normalized event from a provider stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A chunk of model text.
    TextDelta(String),
    /// A complete, decoded function call.
    FunctionCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// Updated token accounting.
    UsageUpdate(Usage),
    /// The stream is done.
    Finish(FinishReason),
}

/// Generation parameters forwarded to the provider.
#[derive(Debug, Clone, Default)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// A single streaming request.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub history: Vec<Content>,
    pub system_instruction: Option<String>,
    pub tools: Vec<ToolDeclaration>,
    pub generation: GenerationConfig,
}

/// Trait every provider service implements.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Opens a streaming completion. The returned sequence is lazy, finite,
    /// and not restartable; it stops early when the signal trips.
    async fn stream(
        &self,
        request: LlmRequest,
        signal: AbortSignal,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// Counts tokens for the given contents. `None` when the provider has
    /// no counting API.
    async fn count_tokens(&self, contents: &[Content]) -> Result<Option<u64>>;

    /// Whether the provider supports function calling.
    fn supports_function_calling(&self) -> bool;

    /// The model this service talks to.
    fn model(&self) -> &str;
}

/// Rough token estimate (four characters per token) used when a provider
/// cannot count and by the compression threshold check.
pub fn estimate_tokens(contents: &[Content]) -> u64 {
    let chars: usize = contents
        .iter()
        .flat_map(|c| c.parts.iter())
        .map(|p| match p {
            Part::Text { text } => text.len(),
            Part::FunctionCall { name, args, .. } => name.len() + args.to_string().len(),
            Part::FunctionResponse { name, response, .. } => {
                name.len() + response.to_string().len()
            }
        })
        .sum();
    (chars / 4) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Content;

    #[test]
    fn test_estimate_tokens_counts_all_part_kinds() {
        let contents = vec![
            Content::user_text("a".repeat(40)),
            Content::model(vec![Part::function_call(
                "c1",
                "sql_tool",
                serde_json::json!({"sql": "SELECT 1"}),
            )]),
        ];
        let estimate = estimate_tokens(&contents);
        assert!(estimate >= 10, "estimate {estimate} too small");
    }

    #[test]
    fn test_finish_reason_strings() {
        assert_eq!(FinishReason::Stop.as_str(), "stop");
        assert_eq!(FinishReason::Aborted.as_str(), "aborted");
    }
}
