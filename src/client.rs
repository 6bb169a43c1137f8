//! Top-level orchestration.
//!
//! The client owns the chat history, the scheduler, the registry, and the
//! LLM service, and drives the turn loop: stream model output, dispatch
//! tool calls, append the paired contents, maybe compress, consult the
//! next-speaker heuristic, repeat until the budget runs out or the model
//! yields. Everything the host sees flows through one ordered event
//! stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::chat::Chat;
use crate::compressor::HistoryCompressor;
use crate::config::AgentConfig;
use crate::connection::ConnectionManager;
use crate::error::DbRheoError;
use crate::llm::{FinishReason, GenerationConfig, LlmRequest, LlmService};
use crate::next_speaker::{self, NextSpeaker};
use crate::risk::RiskLevel;
use crate::scheduler::{SchedulerEvent, ToolScheduler};
use crate::tools::{ToolContext, ToolRegistry};
use crate::turn::Turn;
use crate::types::{AbortSignal, Content, Part, Role};

/// Fallback system prompt; hosts override it via `prompt.system`.
const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a database assistant. You answer questions about the connected \
     database and carry out requests against it using the available tools. \
     Prefer querying over guessing; state clearly what you changed.";

/// Public event stream, one per `send_message_stream`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A chunk of streamed model text.
    Text { delta: String },
    /// A tool call left validation and entered the pipeline.
    ToolStart {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// A gated call is waiting on the user.
    ToolAwaitingConfirmation {
        id: String,
        risk: RiskLevel,
        summary: String,
    },
    /// A call began executing.
    ToolRunning { id: String },
    /// A call reached a terminal state.
    ToolFinished {
        id: String,
        ok: bool,
        summary: String,
    },
    /// Token accounting from the provider.
    UsageUpdate {
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: Option<u64>,
    },
    /// Non-fatal diagnostics (factory fallback, compression failures).
    Warning { message: String },
    /// A fatal error; the stream ends after this.
    Error { kind: String, message: String },
    /// The exchange is over.
    Finish { reason: FinishReason },
}

/// The conversational agent core.
pub struct AgentClient {
    config: Arc<AgentConfig>,
    service: Arc<dyn LlmService>,
    registry: Arc<ToolRegistry>,
    scheduler: Arc<ToolScheduler>,
    connections: Arc<ConnectionManager>,
    compressor: HistoryCompressor,
    chat: tokio::sync::Mutex<Chat>,
    current_signal: std::sync::Mutex<AbortSignal>,
    startup_warning: Option<String>,
    warned: AtomicBool,
}

impl AgentClient {
    /// Wires a client from its collaborators.
    pub fn new(
        config: Arc<AgentConfig>,
        service: Arc<dyn LlmService>,
        registry: Arc<ToolRegistry>,
        connections: Arc<ConnectionManager>,
        startup_warning: Option<String>,
    ) -> Arc<Self> {
        let scheduler = Arc::new(ToolScheduler::new(registry.clone(), config.clone()));
        let compressor = HistoryCompressor::new(service.clone(), config.clone());
        Arc::new(Self {
            config,
            service,
            registry,
            scheduler,
            connections,
            compressor,
            chat: tokio::sync::Mutex::new(Chat::new()),
            current_signal: std::sync::Mutex::new(AbortSignal::new()),
            startup_warning,
            warned: AtomicBool::new(false),
        })
    }

    /// The scheduler, for registering the confirmation gate.
    pub fn scheduler(&self) -> &Arc<ToolScheduler> {
        &self.scheduler
    }

    /// The tool registry.
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The connection manager.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Trips the abort signal of the in-flight exchange.
    pub fn interrupt(&self) {
        self.current_signal
            .lock()
            .expect("signal lock poisoned")
            .trip();
    }

    /// A copy of the history, for hosts and tests.
    pub async fn history_snapshot(&self) -> Vec<Content> {
        self.chat.lock().await.history().to_vec()
    }

    /// Sends a user message and returns the ordered event stream for the
    /// exchange.
    pub fn send_message_stream(
        self: &Arc<Self>,
        text: impl Into<String>,
    ) -> BoxStream<'static, AgentEvent> {
        self.send_parts_stream(vec![Part::text(text.into())])
    }

    /// Part-level variant of [`AgentClient::send_message_stream`].
    pub fn send_parts_stream(self: &Arc<Self>, parts: Vec<Part>) -> BoxStream<'static, AgentEvent> {
        let signal = AbortSignal::new();
        *self
            .current_signal
            .lock()
            .expect("signal lock poisoned") = signal.clone();

        let (tx, rx) = mpsc::channel(64);
        let client = self.clone();
        tokio::spawn(async move {
            client.run_loop(parts, signal, tx).await;
        });
        ReceiverStream::new(rx).boxed()
    }

    async fn run_loop(
        self: Arc<Self>,
        parts: Vec<Part>,
        signal: AbortSignal,
        tx: mpsc::Sender<AgentEvent>,
    ) {
        if let Some(warning) = &self.startup_warning {
            if !self.warned.swap(true, Ordering::SeqCst) {
                let _ = tx
                    .send(AgentEvent::Warning {
                        message: warning.clone(),
                    })
                    .await;
            }
        }

        self.chat
            .lock()
            .await
            .push_user(Content::new(Role::User, parts));

        let ctx = ToolContext::new(self.config.clone(), self.connections.clone());
        let max_turns = self.config.max_turns();
        let mut turns = 0u32;

        loop {
            let request = self.build_request().await;
            let turn = Turn::new(self.service.clone());
            let text_tx = tx.clone();
            let result = turn
                .run(request, &signal, move |delta| {
                    let tx = text_tx.clone();
                    async move {
                        let _ = tx.send(AgentEvent::Text { delta }).await;
                    }
                })
                .await;

            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Turn failed");
                    let _ = tx
                        .send(AgentEvent::Error {
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                        })
                        .await;
                    let _ = tx
                        .send(AgentEvent::Finish {
                            reason: FinishReason::Unspecified,
                        })
                        .await;
                    return;
                }
            };

            if let Some(usage) = result.usage {
                let _ = tx
                    .send(AgentEvent::UsageUpdate {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        cached_tokens: usage.cached_tokens,
                    })
                    .await;
            }

            // An abort mid-stream leaves no partial model content behind.
            if result.finish_reason == FinishReason::Aborted {
                let _ = tx
                    .send(AgentEvent::Finish {
                        reason: FinishReason::Aborted,
                    })
                    .await;
                return;
            }

            turns += 1;

            if result.function_calls.is_empty() {
                if !result.text_segments.is_empty() {
                    self.chat
                        .lock()
                        .await
                        .push_model(Content::model(vec![Part::text(result.joined_text())]));
                }
            } else {
                for call in &result.function_calls {
                    let _ = tx
                        .send(AgentEvent::ToolStart {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            args: call.args.clone(),
                        })
                        .await;
                }

                // The model content carries the turn's text and all its
                // calls; responses land in one paired function content.
                let mut model_parts = Vec::new();
                if !result.text_segments.is_empty() {
                    model_parts.push(Part::text(result.joined_text()));
                }
                for call in &result.function_calls {
                    model_parts.push(Part::function_call(
                        call.id.clone(),
                        call.name.clone(),
                        call.args.clone(),
                    ));
                }

                let (scheduler_tx, scheduler_rx) = mpsc::channel(64);
                let forward = tokio::spawn(forward_scheduler_events(scheduler_rx, tx.clone()));
                let outcome = self
                    .scheduler
                    .dispatch(result.function_calls.clone(), &ctx, &signal, scheduler_tx)
                    .await;
                let _ = forward.await;

                self.chat
                    .lock()
                    .await
                    .record_turn(Content::model(model_parts), Content::function(outcome.responses));
            }

            if signal.is_tripped() {
                let _ = tx
                    .send(AgentEvent::Finish {
                        reason: FinishReason::Aborted,
                    })
                    .await;
                return;
            }

            {
                let mut chat = self.chat.lock().await;
                match self.compressor.maybe_compress(&mut chat, &signal).await {
                    Ok(true) => info!("History compressed"),
                    Ok(false) => {}
                    Err(DbRheoError::Cancelled) => {
                        let _ = tx
                            .send(AgentEvent::Finish {
                                reason: FinishReason::Aborted,
                            })
                            .await;
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "Compression failed, continuing uncompressed");
                        let _ = tx
                            .send(AgentEvent::Warning {
                                message: format!("History compression failed: {e}"),
                            })
                            .await;
                    }
                }
            }

            if turns >= max_turns {
                info!(turns, "Turn budget exhausted");
                break;
            }
            let continue_as_model = {
                let chat = self.chat.lock().await;
                next_speaker::decide(chat.history()) == NextSpeaker::Model
            };
            if !continue_as_model {
                break;
            }
        }

        let _ = tx
            .send(AgentEvent::Finish {
                reason: FinishReason::Stop,
            })
            .await;
    }

    async fn build_request(&self) -> LlmRequest {
        let system = self
            .config
            .get_str("prompt.system", DEFAULT_SYSTEM_PROMPT);
        let temperature = self
            .config
            .get("llm.temperature")
            .and_then(serde_yaml::Value::as_f64)
            .map(|t| t as f32);
        let max_output_tokens =
            Some(self.config.get_u64("llm.max_output_tokens", 4096) as u32);

        LlmRequest {
            history: self.chat.lock().await.history().to_vec(),
            system_instruction: Some(system),
            tools: self.registry.snapshot_for_llm(),
            generation: GenerationConfig {
                temperature,
                max_output_tokens,
            },
        }
    }
}

/// Maps scheduler lifecycle events onto the public event stream.
async fn forward_scheduler_events(
    mut rx: mpsc::Receiver<SchedulerEvent>,
    tx: mpsc::Sender<AgentEvent>,
) {
    while let Some(event) = rx.recv().await {
        let mapped = match event {
            // ToolStart is emitted by the client, which still has the
            // call arguments at hand.
            SchedulerEvent::Validating { .. } => continue,
            SchedulerEvent::AwaitingConfirmation {
                id, risk, summary, ..
            } => AgentEvent::ToolAwaitingConfirmation { id, risk, summary },
            SchedulerEvent::Running { id, .. } => AgentEvent::ToolRunning { id },
            SchedulerEvent::Finished {
                id, ok, summary, ..
            } => AgentEvent::ToolFinished { id, ok, summary },
            SchedulerEvent::Cancelled { id, .. } => AgentEvent::ToolFinished {
                id,
                ok: false,
                summary: "cancelled".to_string(),
            },
        };
        if tx.send(mapped).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AdapterFactory;
    use crate::llm::{MockLlmService, StreamEvent};
    use crate::tools::{register_builtin_tools, Capability, Tool, ToolOutput};
    use crate::types::Part;
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::time::Duration;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo_tool"
        }
        fn description(&self) -> &str {
            "echoes its arguments"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::Read]
        }
        async fn execute(
            &self,
            args: &serde_json::Value,
            _ctx: &ToolContext,
            _signal: &AbortSignal,
        ) -> crate::error::Result<ToolOutput> {
            Ok(ToolOutput::new(
                serde_json::json!({"echo": args.clone()}),
                "echoed",
            ))
        }
    }

    fn client_with(
        mock: MockLlmService,
        overrides: serde_yaml::Value,
    ) -> Arc<AgentClient> {
        let config = Arc::new(AgentConfig::for_tests(overrides));
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(Arc::new(EchoTool), vec![], 0, serde_json::Value::Null)
            .unwrap();
        let connections = Arc::new(ConnectionManager::new(Arc::new(AdapterFactory::new())));
        AgentClient::new(config, Arc::new(mock), registry, connections, None)
    }

    async fn collect(mut stream: BoxStream<'static, AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_text_only_exchange() {
        let mock = MockLlmService::new().with_script(MockLlmService::text_reply("Hello there."));
        let client = client_with(mock, serde_yaml::Value::Null);

        let events = collect(client.send_message_stream("hi")).await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Text { delta } => Some(delta.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello there.");
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Finish {
                reason: FinishReason::Stop
            })
        ));

        let history = client.history_snapshot().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].joined_text(), "Hello there.");
    }

    #[tokio::test]
    async fn test_tool_call_round_trip_keeps_history_paired() {
        let mock = MockLlmService::new()
            .with_script(MockLlmService::tool_call_reply(
                "c1",
                "echo_tool",
                serde_json::json!({"word": "ping"}),
            ))
            .with_script(MockLlmService::text_reply("It said ping."));
        // Raise the threshold so the unknown-to-risk echo tool skips the
        // gate.
        let client = client_with(
            mock,
            serde_yaml::from_str("risk:\n  confirmation_threshold: high").unwrap(),
        );

        let events = collect(client.send_message_stream("echo ping")).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolStart { id, .. } if id == "c1")));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolRunning { id } if id == "c1")));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolFinished { id, ok: true, .. } if id == "c1")));

        let history = client.history_snapshot().await;
        // user, model(call), function(response), model(text)
        assert_eq!(history.len(), 4);
        assert_eq!(history[1].call_ids(), vec!["c1"]);
        assert_eq!(history[2].parts[0].response_id(), Some("c1"));
        assert_eq!(history[3].joined_text(), "It said ping.");
        assert!(Chat::from_history(history).pairing_is_valid());
    }

    #[tokio::test]
    async fn test_rejected_tool_call_reports_risk_rejected() {
        let mock = MockLlmService::new()
            .with_script(MockLlmService::tool_call_reply(
                "c1",
                "echo_tool",
                serde_json::json!({"word": "ping"}),
            ))
            .with_script(MockLlmService::text_reply("Understood, skipping that."));
        // Default config gates the medium-classified echo tool.
        let client = client_with(mock, serde_yaml::Value::Null);
        client.scheduler().on_confirmation_required(Arc::new(|_req| {
            async {
                crate::scheduler::ConfirmationDecision {
                    approved: false,
                    remember: false,
                }
            }.boxed()
        }));

        let events = collect(client.send_message_stream("echo ping")).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolAwaitingConfirmation { id, .. } if id == "c1")));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolFinished { id, ok: false, .. } if id == "c1")));

        let history = client.history_snapshot().await;
        match &history[2].parts[0] {
            Part::FunctionResponse { response, .. } => {
                assert_eq!(response["error"]["kind"], "RiskRejectedError");
            }
            other => panic!("expected function response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_interrupt_mid_stream_leaves_only_user_content() {
        let mock = MockLlmService::new()
            .with_event_delay(Duration::from_millis(40))
            .with_script(vec![
                StreamEvent::TextDelta("chunk one ".to_string()),
                StreamEvent::TextDelta("chunk two ".to_string()),
                StreamEvent::TextDelta("chunk three".to_string()),
                StreamEvent::Finish(FinishReason::Stop),
            ]);
        let client = client_with(mock, serde_yaml::Value::Null);

        let mut stream = client.send_message_stream("long question");
        // Let the first chunk arrive, then interrupt.
        let first = stream.next().await;
        assert!(first.is_some());
        client.interrupt();
        let rest = collect(stream).await;

        assert!(matches!(
            rest.last(),
            Some(AgentEvent::Finish {
                reason: FinishReason::Aborted
            })
        ));

        let history = client.history_snapshot().await;
        assert_eq!(history.len(), 1, "only the user content is committed");
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_max_turns_caps_auto_continuation() {
        // Every turn requests another tool call; the cap must stop the
        // loop.
        let mock = MockLlmService::new();
        for i in 0..10 {
            mock.push_script(MockLlmService::tool_call_reply(
                &format!("c{i}"),
                "echo_tool",
                serde_json::json!({"turn": i}),
            ));
        }
        let client = client_with(
            mock,
            serde_yaml::from_str(
                "max_turns: 2\nrisk:\n  confirmation_threshold: high",
            )
            .unwrap(),
        );

        let events = collect(client.send_message_stream("loop forever")).await;
        let tool_starts = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolStart { .. }))
            .count();
        assert_eq!(tool_starts, 2);
    }

    #[tokio::test]
    async fn test_startup_warning_emitted_once() {
        let config = Arc::new(AgentConfig::for_tests(serde_yaml::Value::Null));
        let registry = Arc::new(ToolRegistry::new());
        register_builtin_tools(&registry).unwrap();
        let connections = Arc::new(ConnectionManager::new(Arc::new(AdapterFactory::new())));
        let mock = MockLlmService::new()
            .with_script(MockLlmService::text_reply("a"))
            .with_script(MockLlmService::text_reply("b"));
        let client = AgentClient::new(
            config,
            Arc::new(mock),
            registry,
            connections,
            Some("Unknown model prefix 'mistral-large'; falling back".to_string()),
        );

        let first = collect(client.send_message_stream("one")).await;
        assert!(matches!(first.first(), Some(AgentEvent::Warning { .. })));

        let second = collect(client.send_message_stream("two")).await;
        assert!(!second
            .iter()
            .any(|e| matches!(e, AgentEvent::Warning { .. })));
    }
}
