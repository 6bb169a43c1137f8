//! Mock LLM service for testing.
//!
//! Plays back scripted event sequences, one per `stream` call, and records
//! the requests it receives so tests can assert on history shape.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use super::{estimate_tokens, FinishReason, LlmRequest, LlmService, StreamEvent};
use crate::error::Result;
use crate::types::{AbortSignal, Content};

/// A scripted mock service.
pub struct MockLlmService {
    model: String,
    scripts: Mutex<Vec<Vec<StreamEvent>>>,
    requests: Mutex<Vec<LlmRequest>>,
    /// Delay between played-back events, for cancellation tests.
    event_delay: Duration,
}

impl MockLlmService {
    /// Creates a mock that answers every call with a plain text reply.
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            scripts: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            event_delay: Duration::ZERO,
        }
    }

    /// Queues one scripted response (played back in FIFO order).
    pub fn push_script(&self, events: Vec<StreamEvent>) {
        self.scripts.lock().expect("mock lock poisoned").push(events);
    }

    /// Builder form of [`MockLlmService::push_script`].
    pub fn with_script(self, events: Vec<StreamEvent>) -> Self {
        self.push_script(events);
        self
    }

    /// Adds a delay between events, so aborts can land mid-stream.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// A script that streams text then stops.
    pub fn text_reply(text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::TextDelta(text.to_string()),
            StreamEvent::Finish(FinishReason::Stop),
        ]
    }

    /// A script that requests one tool call.
    pub fn tool_call_reply(id: &str, name: &str, args: serde_json::Value) -> Vec<StreamEvent> {
        vec![
            StreamEvent::FunctionCall {
                id: id.to_string(),
                name: name.to_string(),
                args,
            },
            StreamEvent::Finish(FinishReason::Stop),
        ]
    }

    /// The requests seen so far.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().expect("mock lock poisoned").clone()
    }
}

impl Default for MockLlmService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmService for MockLlmService {
    async fn stream(
        &self,
        request: LlmRequest,
        signal: AbortSignal,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.requests
            .lock()
            .expect("mock lock poisoned")
            .push(request);

        let script = {
            let mut scripts = self.scripts.lock().expect("mock lock poisoned");
            if scripts.is_empty() {
                Self::text_reply("This is a mock reply.")
            } else {
                scripts.remove(0)
            }
        };

        let delay = self.event_delay;
        let events = futures::stream::iter(script.into_iter().map(Ok))
            .then(move |event| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                event
            })
            .take_until(signal.tripped_owned());

        Ok(events.boxed())
    }

    async fn count_tokens(&self, contents: &[Content]) -> Result<Option<u64>> {
        Ok(Some(estimate_tokens(contents)))
    }

    fn supports_function_calling(&self) -> bool {
        true
    }

    fn model(&self) -> &str {
        &self.model
    }
}
