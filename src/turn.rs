//! One round of model streaming.
//!
//! A turn sends the current history to the LLM service, relays text deltas
//! to the caller as they arrive, and collects the function calls the model
//! emitted. It never mutates history; the client commits contents after
//! the turn completes.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tracing::debug;

use crate::error::Result;
use crate::llm::{FinishReason, LlmRequest, LlmService, StreamEvent, Usage};
use crate::scheduler::FunctionCallRequest;
use crate::types::AbortSignal;

/// What one turn produced.
#[derive(Debug, Clone)]
pub struct TurnResult {
    /// Text segments in arrival order.
    pub text_segments: Vec<String>,
    /// Function calls in arrival order.
    pub function_calls: Vec<FunctionCallRequest>,
    /// Last usage report, if the provider sent one.
    pub usage: Option<Usage>,
    /// Why the stream ended.
    pub finish_reason: FinishReason,
}

impl TurnResult {
    /// All text joined into one string.
    pub fn joined_text(&self) -> String {
        self.text_segments.join("")
    }
}

/// Executes single streaming invocations against a service.
pub struct Turn {
    service: Arc<dyn LlmService>,
}

impl Turn {
    /// Creates a turn runner over a service.
    pub fn new(service: Arc<dyn LlmService>) -> Self {
        Self { service }
    }

    /// Runs one invocation. `on_text` fires for every text delta as it
    /// arrives.
    pub async fn run<F, Fut>(
        &self,
        request: LlmRequest,
        signal: &AbortSignal,
        mut on_text: F,
    ) -> Result<TurnResult>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut stream = self.service.stream(request, signal.clone()).await?;

        let mut text_segments = Vec::new();
        let mut function_calls = Vec::new();
        let mut usage = None;
        let mut finish_reason = None;

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta(delta) => {
                    on_text(delta.clone()).await;
                    text_segments.push(delta);
                }
                StreamEvent::FunctionCall { id, name, args } => {
                    debug!(id = %id, tool = %name, "Model requested a tool call");
                    function_calls.push(FunctionCallRequest { id, name, args });
                }
                StreamEvent::UsageUpdate(update) => usage = Some(update),
                StreamEvent::Finish(reason) => {
                    finish_reason = Some(reason);
                    break;
                }
            }
        }

        let finish_reason = if signal.is_tripped() {
            FinishReason::Aborted
        } else {
            finish_reason.unwrap_or(FinishReason::Stop)
        };

        Ok(TurnResult {
            text_segments,
            function_calls,
            usage,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmService;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_turn_collects_text_and_calls() {
        let service = Arc::new(
            MockLlmService::new().with_script(vec![
                StreamEvent::TextDelta("Looking ".to_string()),
                StreamEvent::TextDelta("that up.".to_string()),
                StreamEvent::FunctionCall {
                    id: "c1".to_string(),
                    name: "sql_tool".to_string(),
                    args: serde_json::json!({"sql": "SELECT 1"}),
                },
                StreamEvent::UsageUpdate(Usage {
                    input_tokens: 5,
                    output_tokens: 3,
                    cached_tokens: None,
                }),
                StreamEvent::Finish(FinishReason::Stop),
            ]),
        );

        let relayed = Arc::new(Mutex::new(Vec::new()));
        let relayed_clone = relayed.clone();
        let result = Turn::new(service)
            .run(LlmRequest::default(), &AbortSignal::new(), move |delta| {
                let relayed = relayed_clone.clone();
                async move {
                    relayed.lock().unwrap().push(delta);
                }
            })
            .await
            .unwrap();

        assert_eq!(result.joined_text(), "Looking that up.");
        assert_eq!(result.function_calls.len(), 1);
        assert_eq!(result.function_calls[0].id, "c1");
        assert_eq!(result.usage.unwrap().input_tokens, 5);
        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(
            *relayed.lock().unwrap(),
            vec!["Looking ".to_string(), "that up.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_aborted_turn_reports_aborted() {
        let service = Arc::new(
            MockLlmService::new()
                .with_event_delay(Duration::from_millis(30))
                .with_script(vec![
                    StreamEvent::TextDelta("one".to_string()),
                    StreamEvent::TextDelta("two".to_string()),
                    StreamEvent::TextDelta("three".to_string()),
                    StreamEvent::Finish(FinishReason::Stop),
                ]),
        );

        let signal = AbortSignal::new();
        let trip = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(45)).await;
            trip.trip();
        });

        let result = Turn::new(service)
            .run(LlmRequest::default(), &signal, |_| async {})
            .await
            .unwrap();

        assert_eq!(result.finish_reason, FinishReason::Aborted);
        assert!(result.text_segments.len() < 3);
    }

    #[tokio::test]
    async fn test_stream_without_finish_defaults_to_stop() {
        let service = Arc::new(
            MockLlmService::new().with_script(vec![StreamEvent::TextDelta("hi".to_string())]),
        );
        let result = Turn::new(service)
            .run(LlmRequest::default(), &AbortSignal::new(), |_| async {})
            .await
            .unwrap();
        assert_eq!(result.finish_reason, FinishReason::Stop);
    }
}
