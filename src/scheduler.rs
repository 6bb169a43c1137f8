//! Tool scheduler: drives each function call emitted by a turn through its
//! lifecycle state machine.
//!
//! ```text
//! validating -> (args invalid)              -> error
//! validating -> (risk < threshold OR auto)  -> queued
//! validating -> (risk >= threshold)         -> awaiting_confirmation
//! awaiting_confirmation -> (approved)       -> queued
//! awaiting_confirmation -> (rejected)       -> cancelled
//! queued -> executing -> success | error | cancelled
//! ```
//!
//! Within one dispatch the scheduler preserves arrival order when
//! assembling function responses, whatever order executions finish in.
//! Calls whose tools claim only side-effect-free capabilities (and safe
//! read-classified queries) run concurrently up to the configured fan-out;
//! everything else is serialized.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::DbRheoError;
use crate::risk::{self, RiskAssessment, RiskLevel};
use crate::tools::{Tool, ToolContext, ToolOutput, ToolRegistry};
use crate::types::{AbortSignal, Part};

/// Reserved argument key for a per-call timeout override, in milliseconds.
const TIMEOUT_OVERRIDE_KEY: &str = "_timeout_ms";

/// Lifecycle states of a tool call. Transitions are forward-only; a call
/// in a terminal state never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Validating,
    AwaitingConfirmation,
    Queued,
    Executing,
    Success,
    Error,
    Cancelled,
}

impl CallState {
    /// Terminal states are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

/// A function call as it arrives from the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallRequest {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// How a call cleared (or failed) the confirmation gate. `None` on the
/// record means the gate was never consulted for this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// The host approved this call only.
    Approved,
    /// The host approved and promoted the decision to session scope; also
    /// recorded on later calls that skip the gate via that memo.
    ApprovedRemembered,
    /// The host (or policy, when no handler is registered) rejected the
    /// call.
    Rejected,
}

/// Bookkeeping for one call moving through the state machine.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
    pub state: CallState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub risk: Option<RiskAssessment>,
    pub confirmation: Option<ConfirmationOutcome>,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
}

impl ToolCallRecord {
    fn new(request: &FunctionCallRequest) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            args: request.args.clone(),
            state: CallState::Validating,
            result: None,
            error: None,
            risk: None,
            confirmation: None,
            started_at: None,
            ended_at: None,
        }
    }

    /// Advances the state. A terminal state never changes again.
    fn advance(&mut self, next: CallState) {
        if self.state.is_terminal() {
            warn!(id = %self.id, from = ?self.state, to = ?next, "Ignored transition out of terminal state");
            return;
        }
        self.state = next;
        if next == CallState::Executing {
            self.started_at = Some(SystemTime::now());
        }
        if next.is_terminal() {
            self.ended_at = Some(SystemTime::now());
        }
    }
}

/// Lifecycle events streamed to the host UI.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Validating {
        id: String,
        name: String,
    },
    AwaitingConfirmation {
        id: String,
        name: String,
        risk: RiskLevel,
        summary: String,
    },
    Running {
        id: String,
        name: String,
    },
    Finished {
        id: String,
        name: String,
        ok: bool,
        summary: String,
    },
    Cancelled {
        id: String,
        name: String,
    },
}

/// What the host shows the user when a gated call needs approval.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub id: String,
    pub tool: String,
    pub args: serde_json::Value,
    pub risk: RiskAssessment,
    pub summary: String,
}

/// The host's answer. `remember` promotes the approval to session scope so
/// identical calls skip the gate.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationDecision {
    pub approved: bool,
    pub remember: bool,
}

/// Host-supplied confirmation gate.
pub type ConfirmationHandler =
    Arc<dyn Fn(ConfirmationRequest) -> BoxFuture<'static, ConfirmationDecision> + Send + Sync>;

/// Everything a dispatch produces: responses in arrival order plus the
/// per-call records.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub responses: Vec<Part>,
    pub records: Vec<ToolCallRecord>,
}

enum ExecOutcome {
    Success(ToolOutput),
    Failure(DbRheoError),
    Cancelled,
}

/// Drives tool calls through validation, confirmation, and execution.
pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    config: Arc<AgentConfig>,
    handler: RwLock<Option<ConfirmationHandler>>,
    /// Session-scoped remembered approvals keyed by (tool, args
    /// fingerprint).
    remembered: Mutex<HashSet<(String, String)>>,
}

impl ToolScheduler {
    /// Creates a scheduler over a registry.
    pub fn new(registry: Arc<ToolRegistry>, config: Arc<AgentConfig>) -> Self {
        Self {
            registry,
            config,
            handler: RwLock::new(None),
            remembered: Mutex::new(HashSet::new()),
        }
    }

    /// Registers the user-facing confirmation gate. Without one, gated
    /// calls are rejected.
    pub fn on_confirmation_required(&self, handler: ConfirmationHandler) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    /// Dispatches one turn's worth of calls and returns function responses
    /// in arrival order.
    pub async fn dispatch(
        &self,
        calls: Vec<FunctionCallRequest>,
        ctx: &ToolContext,
        signal: &AbortSignal,
        events: mpsc::Sender<SchedulerEvent>,
    ) -> DispatchOutcome {
        let mut records: Vec<ToolCallRecord> = calls.iter().map(ToolCallRecord::new).collect();

        // Phase 1: validation and the confirmation gate, in arrival order.
        for record in records.iter_mut() {
            self.validate_and_gate(record, signal, &events).await;
        }

        // Phase 2: execution. Side-effect-free calls fan out; the rest run
        // serialized, in arrival order.
        let mut concurrent: Vec<usize> = Vec::new();
        let mut serial: Vec<usize> = Vec::new();
        for (index, record) in records.iter().enumerate() {
            if record.state != CallState::Queued {
                continue;
            }
            if self.call_is_side_effect_free(record) {
                concurrent.push(index);
            } else {
                serial.push(index);
            }
        }

        let concurrent_results = {
            let fan_out = self.config.scheduler_fan_out();
            futures::stream::iter(concurrent.iter().copied().map(|index| {
                let record = records[index].clone();
                let events = events.clone();
                async move { (index, self.execute_one(&record, ctx, signal, &events).await) }
            }))
            .buffer_unordered(fan_out)
            .collect::<Vec<(usize, (Option<SystemTime>, ExecOutcome))>>()
            .await
        };

        let mut serial_results: Vec<(usize, (Option<SystemTime>, ExecOutcome))> =
            Vec::with_capacity(serial.len());
        for index in serial {
            let record = records[index].clone();
            let result = self.execute_one(&record, ctx, signal, &events).await;
            serial_results.push((index, result));
        }

        for (index, (started_at, outcome)) in concurrent_results.into_iter().chain(serial_results) {
            let record = &mut records[index];
            if let Some(started_at) = started_at {
                record.advance(CallState::Executing);
                record.started_at = Some(started_at);
            }
            match outcome {
                ExecOutcome::Success(output) => {
                    record.result = Some(output.content);
                    record.advance(CallState::Success);
                    let _ = events
                        .send(SchedulerEvent::Finished {
                            id: record.id.clone(),
                            name: record.name.clone(),
                            ok: true,
                            summary: output.summary,
                        })
                        .await;
                }
                ExecOutcome::Failure(error) => {
                    record.result = Some(error.to_payload());
                    record.error = Some(error.to_string());
                    record.advance(CallState::Error);
                    let _ = events
                        .send(SchedulerEvent::Finished {
                            id: record.id.clone(),
                            name: record.name.clone(),
                            ok: false,
                            summary: error.to_string(),
                        })
                        .await;
                }
                ExecOutcome::Cancelled => {
                    record.result = Some(DbRheoError::Cancelled.to_payload());
                    record.error = Some(DbRheoError::Cancelled.to_string());
                    record.advance(CallState::Cancelled);
                    let _ = events
                        .send(SchedulerEvent::Cancelled {
                            id: record.id.clone(),
                            name: record.name.clone(),
                        })
                        .await;
                }
            }
        }

        // Assemble responses in arrival order, one per call.
        let responses = records.iter().map(response_part).collect();
        DispatchOutcome { responses, records }
    }

    async fn validate_and_gate(
        &self,
        record: &mut ToolCallRecord,
        signal: &AbortSignal,
        events: &mpsc::Sender<SchedulerEvent>,
    ) {
        let _ = events
            .send(SchedulerEvent::Validating {
                id: record.id.clone(),
                name: record.name.clone(),
            })
            .await;

        if signal.is_tripped() {
            self.fail(record, CallState::Cancelled, DbRheoError::Cancelled);
            return;
        }

        let Some(tool) = self.registry.get(&record.name) else {
            self.fail(
                record,
                CallState::Error,
                DbRheoError::invalid_tool_call(format!("Unknown tool '{}'", record.name)),
            );
            return;
        };

        if let Err(e) = tool.validate_args(&record.args) {
            self.fail(record, CallState::Error, e);
            return;
        }

        let assessment = risk::evaluate(&record.name, &record.args, &self.config);
        debug!(id = %record.id, tool = %record.name, level = %assessment.level, "Risk assessed");
        record.risk = Some(assessment.clone());

        let fingerprint = (record.name.clone(), fingerprint(&record.args));
        let remembered = self
            .remembered
            .lock()
            .expect("remembered lock poisoned")
            .contains(&fingerprint);

        if !assessment.requires_confirmation || self.config.auto_execute() || remembered {
            if remembered {
                record.confirmation = Some(ConfirmationOutcome::ApprovedRemembered);
            }
            record.advance(CallState::Queued);
            return;
        }

        record.advance(CallState::AwaitingConfirmation);
        let _ = events
            .send(SchedulerEvent::AwaitingConfirmation {
                id: record.id.clone(),
                name: record.name.clone(),
                risk: assessment.level,
                summary: assessment.reasons.join("; "),
            })
            .await;

        let handler = self.handler.read().expect("handler lock poisoned").clone();
        let Some(handler) = handler else {
            record.confirmation = Some(ConfirmationOutcome::Rejected);
            self.fail(
                record,
                CallState::Cancelled,
                DbRheoError::risk_rejected(
                    "Confirmation required but no confirmation handler is registered",
                ),
            );
            return;
        };

        let request = ConfirmationRequest {
            id: record.id.clone(),
            tool: record.name.clone(),
            args: record.args.clone(),
            risk: assessment,
            summary: summarize_args(&record.args),
        };

        // Cancellation during the wait moves the call straight to
        // cancelled.
        let decision = tokio::select! {
            decision = handler(request) => decision,
            _ = signal.tripped() => {
                self.fail(record, CallState::Cancelled, DbRheoError::Cancelled);
                return;
            }
        };

        if decision.approved {
            if decision.remember {
                self.remembered
                    .lock()
                    .expect("remembered lock poisoned")
                    .insert(fingerprint);
                record.confirmation = Some(ConfirmationOutcome::ApprovedRemembered);
            } else {
                record.confirmation = Some(ConfirmationOutcome::Approved);
            }
            record.advance(CallState::Queued);
        } else {
            record.confirmation = Some(ConfirmationOutcome::Rejected);
            self.fail(
                record,
                CallState::Cancelled,
                DbRheoError::risk_rejected("The user rejected this operation"),
            );
        }
    }

    fn fail(&self, record: &mut ToolCallRecord, state: CallState, error: DbRheoError) {
        record.result = Some(error.to_payload());
        record.error = Some(error.to_string());
        record.advance(state);
    }

    /// A call may run concurrently when its tool claims only
    /// side-effect-free capabilities, or when it is a safe-classified call
    /// on a query-capable tool (a pure read).
    fn call_is_side_effect_free(&self, record: &ToolCallRecord) -> bool {
        let Some(registration) = self.registry.registration(&record.name) else {
            return false;
        };
        if registration
            .capabilities
            .iter()
            .all(|c| c.side_effect_free())
        {
            return true;
        }
        registration
            .capabilities
            .iter()
            .any(|c| c.side_effect_free())
            && record.risk.as_ref().map(|r| r.level) == Some(RiskLevel::Safe)
    }

    /// Runs one queued call. Returns when it started (None when the abort
    /// pre-empted it) plus the outcome.
    async fn execute_one(
        &self,
        record: &ToolCallRecord,
        ctx: &ToolContext,
        signal: &AbortSignal,
        events: &mpsc::Sender<SchedulerEvent>,
    ) -> (Option<SystemTime>, ExecOutcome) {
        // No call starts executing after an abort.
        if signal.is_tripped() {
            return (None, ExecOutcome::Cancelled);
        }

        let Some(tool) = self.registry.get(&record.name) else {
            return (
                None,
                ExecOutcome::Failure(DbRheoError::invalid_tool_call(format!(
                    "Unknown tool '{}'",
                    record.name
                ))),
            );
        };

        let timeout = record
            .args
            .get(TIMEOUT_OVERRIDE_KEY)
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or_else(|| tool.default_timeout());

        let _ = events
            .send(SchedulerEvent::Running {
                id: record.id.clone(),
                name: record.name.clone(),
            })
            .await;
        let started_at = SystemTime::now();

        let args = record.args.clone();
        let task_ctx = ctx.clone();
        let task_signal = signal.clone();
        let mut task = tokio::spawn(async move {
            tool.execute(&args, &task_ctx, &task_signal).await
        });

        let grace = Duration::from_millis(self.config.cancel_grace_ms());
        let outcome = tokio::select! {
            finished = tokio::time::timeout(timeout, &mut task) => match finished {
                Err(_elapsed) => {
                    task.abort();
                    ExecOutcome::Failure(DbRheoError::timeout(format!(
                        "Tool '{}' exceeded {}ms",
                        record.name,
                        timeout.as_millis()
                    )))
                }
                Ok(Ok(Ok(output))) => ExecOutcome::Success(output),
                Ok(Ok(Err(DbRheoError::Cancelled))) => ExecOutcome::Cancelled,
                Ok(Ok(Err(e))) => ExecOutcome::Failure(e),
                Ok(Err(join_error)) => ExecOutcome::Failure(DbRheoError::internal(format!(
                    "Tool task failed: {join_error}"
                ))),
            },
            _ = signal.tripped() => {
                // Cooperative cancel: the tool sees the same signal and
                // gets a bounded grace period before we detach.
                if tokio::time::timeout(grace, &mut task).await.is_err() {
                    task.abort();
                }
                ExecOutcome::Cancelled
            }
        };
        (Some(started_at), outcome)
    }
}

/// Builds the function response part for a finished record.
fn response_part(record: &ToolCallRecord) -> Part {
    let payload = record
        .result
        .clone()
        .unwrap_or_else(|| DbRheoError::internal("tool produced no result").to_payload());
    match &record.error {
        Some(error) => Part::function_error(&record.id, &record.name, payload, error.clone()),
        None => Part::function_response(&record.id, &record.name, payload),
    }
}

/// Canonical fingerprint of the argument object: keys sorted recursively.
fn fingerprint(args: &serde_json::Value) -> String {
    canonicalize(args).to_string()
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            sorted.sort_by_key(|(k, _)| k.as_str());
            serde_json::Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

fn summarize_args(args: &serde_json::Value) -> String {
    if let Some(sql) = args.get("sql").and_then(|v| v.as_str()) {
        return sql.chars().take(120).collect();
    }
    if let Some(command) = args.get("command").and_then(|v| v.as_str()) {
        return command.chars().take(120).collect();
    }
    let rendered = args.to_string();
    rendered.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Capability;
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTool {
        name: &'static str,
        capabilities: Vec<Capability>,
        delay: Duration,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl TestTool {
        fn reader(name: &'static str, delay: Duration) -> Self {
            Self {
                name,
                capabilities: vec![Capability::Read],
                delay,
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn writer(name: &'static str, delay: Duration) -> Self {
            Self {
                capabilities: vec![Capability::Write],
                ..Self::reader(name, delay)
            }
        }
    }

    #[async_trait]
    impl Tool for TestTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        fn capabilities(&self) -> &[Capability] {
            &self.capabilities
        }
        fn default_timeout(&self) -> Duration {
            Duration::from_secs(5)
        }
        fn validate_args(&self, args: &serde_json::Value) -> crate::error::Result<()> {
            if args.get("invalid").is_some() {
                return Err(DbRheoError::invalid_tool_call("invalid marker present"));
            }
            Ok(())
        }
        async fn execute(
            &self,
            args: &serde_json::Value,
            _ctx: &ToolContext,
            signal: &AbortSignal,
        ) -> crate::error::Result<ToolOutput> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(ToolOutput::new(
                    serde_json::json!({"echo": args.clone()}),
                    format!("{} done", self.name),
                )),
                _ = signal.tripped() => Err(DbRheoError::Cancelled),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn context() -> ToolContext {
        ToolContext::new(
            Arc::new(AgentConfig::for_tests(serde_yaml::Value::Null)),
            Arc::new(crate::connection::ConnectionManager::new(Arc::new(
                crate::db::AdapterFactory::new(),
            ))),
        )
    }

    /// Test tools are unknown to the risk evaluator and classify medium;
    /// a high threshold keeps them out of the gate unless a test wants it.
    fn scheduler_with(tools: Vec<Arc<dyn Tool>>) -> ToolScheduler {
        scheduler_with_config(
            tools,
            serde_yaml::from_str("risk:\n  confirmation_threshold: high").unwrap(),
        )
    }

    fn gated_scheduler_with(tools: Vec<Arc<dyn Tool>>) -> ToolScheduler {
        scheduler_with_config(tools, serde_yaml::Value::Null)
    }

    fn scheduler_with_config(tools: Vec<Arc<dyn Tool>>, overrides: serde_yaml::Value) -> ToolScheduler {
        let registry = Arc::new(ToolRegistry::new());
        for tool in tools {
            registry
                .register(tool, vec![], 0, serde_json::Value::Null)
                .unwrap();
        }
        ToolScheduler::new(registry, Arc::new(AgentConfig::for_tests(overrides)))
    }

    fn call(id: &str, name: &str) -> FunctionCallRequest {
        FunctionCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            args: serde_json::json!({}),
        }
    }

    fn events() -> (mpsc::Sender<SchedulerEvent>, mpsc::Receiver<SchedulerEvent>) {
        mpsc::channel(64)
    }

    #[tokio::test]
    async fn test_success_path_produces_paired_response() {
        let scheduler = scheduler_with(vec![Arc::new(TestTool::reader(
            "fast_reader",
            Duration::from_millis(1),
        ))]);
        let (tx, _rx) = events();

        let outcome = scheduler
            .dispatch(
                vec![call("c1", "fast_reader")],
                &context(),
                &AbortSignal::new(),
                tx,
            )
            .await;

        assert_eq!(outcome.records[0].state, CallState::Success);
        // The gate was never consulted for an ungated call.
        assert_eq!(outcome.records[0].confirmation, None);
        assert_eq!(outcome.responses.len(), 1);
        assert_eq!(outcome.responses[0].response_id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_responses_keep_arrival_order_despite_completion_order() {
        let slow = Arc::new(TestTool::reader("slow_reader", Duration::from_millis(80)));
        let fast = Arc::new(TestTool::reader("fast_reader", Duration::from_millis(1)));
        let scheduler = scheduler_with(vec![slow, fast]);
        let (tx, _rx) = events();

        let outcome = scheduler
            .dispatch(
                vec![call("c1", "slow_reader"), call("c2", "fast_reader")],
                &context(),
                &AbortSignal::new(),
                tx,
            )
            .await;

        // The fast call finishes first, but c1 is still first in the
        // assembled responses.
        let ids: Vec<Option<&str>> = outcome.responses.iter().map(|p| p.response_id()).collect();
        assert_eq!(ids, vec![Some("c1"), Some("c2")]);
    }

    #[tokio::test]
    async fn test_side_effect_free_calls_run_concurrently() {
        let reader = Arc::new(TestTool::reader("reader", Duration::from_millis(50)));
        let peak = reader.peak.clone();
        let scheduler = scheduler_with(vec![reader]);
        let (tx, _rx) = events();

        scheduler
            .dispatch(
                vec![call("c1", "reader"), call("c2", "reader"), call("c3", "reader")],
                &context(),
                &AbortSignal::new(),
                tx,
            )
            .await;

        assert!(peak.load(Ordering::SeqCst) > 1, "reads should overlap");
    }

    #[tokio::test]
    async fn test_side_effectful_calls_are_serialized() {
        let writer = Arc::new(TestTool::writer("writer", Duration::from_millis(20)));
        let peak = writer.peak.clone();
        let scheduler = scheduler_with(vec![writer]);
        let (tx, _rx) = events();

        scheduler
            .dispatch(
                vec![call("c1", "writer"), call("c2", "writer")],
                &context(),
                &AbortSignal::new(),
                tx,
            )
            .await;

        assert_eq!(peak.load(Ordering::SeqCst), 1, "writes must not overlap");
    }

    #[tokio::test]
    async fn test_invalid_args_move_to_error() {
        let scheduler = scheduler_with(vec![Arc::new(TestTool::reader(
            "reader",
            Duration::from_millis(1),
        ))]);
        let (tx, _rx) = events();

        let mut request = call("c1", "reader");
        request.args = serde_json::json!({"invalid": true});
        let outcome = scheduler
            .dispatch(vec![request], &context(), &AbortSignal::new(), tx)
            .await;

        assert_eq!(outcome.records[0].state, CallState::Error);
        match &outcome.responses[0] {
            Part::FunctionResponse { response, error, .. } => {
                assert_eq!(response["error"]["kind"], "InvalidToolCallError");
                assert!(error.is_some());
            }
            other => panic!("expected function response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_moves_to_error() {
        let scheduler = scheduler_with(vec![]);
        let (tx, _rx) = events();
        let outcome = scheduler
            .dispatch(vec![call("c1", "ghost_tool")], &context(), &AbortSignal::new(), tx)
            .await;
        assert_eq!(outcome.records[0].state, CallState::Error);
    }

    #[tokio::test]
    async fn test_rejection_cancels_with_risk_rejected_payload() {
        // An unknown-capability writer classifies medium, requiring the
        // gate.
        let scheduler = gated_scheduler_with(vec![Arc::new(TestTool::writer(
            "writer",
            Duration::from_millis(1),
        ))]);
        scheduler.on_confirmation_required(Arc::new(|_req| {
            async {
                ConfirmationDecision {
                    approved: false,
                    remember: false,
                }
            }.boxed()
        }));
        let (tx, _rx) = events();

        let outcome = scheduler
            .dispatch(vec![call("c1", "writer")], &context(), &AbortSignal::new(), tx)
            .await;

        assert_eq!(outcome.records[0].state, CallState::Cancelled);
        assert_eq!(
            outcome.records[0].confirmation,
            Some(ConfirmationOutcome::Rejected)
        );
        match &outcome.responses[0] {
            Part::FunctionResponse { response, .. } => {
                assert_eq!(response["error"]["kind"], "RiskRejectedError");
            }
            other => panic!("expected function response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_approval_queues_and_remember_skips_next_gate() {
        let scheduler = gated_scheduler_with(vec![Arc::new(TestTool::writer(
            "writer",
            Duration::from_millis(1),
        ))]);
        let asked = Arc::new(AtomicUsize::new(0));
        let asked_clone = asked.clone();
        scheduler.on_confirmation_required(Arc::new(move |_req| {
            asked_clone.fetch_add(1, Ordering::SeqCst);
            async {
                ConfirmationDecision {
                    approved: true,
                    remember: true,
                }
            }.boxed()
        }));
        let (tx, _rx) = events();
        let outcome = scheduler
            .dispatch(vec![call("c1", "writer")], &context(), &AbortSignal::new(), tx)
            .await;
        assert_eq!(outcome.records[0].state, CallState::Success);
        assert_eq!(
            outcome.records[0].confirmation,
            Some(ConfirmationOutcome::ApprovedRemembered)
        );
        assert_eq!(asked.load(Ordering::SeqCst), 1);

        // Identical (tool, args) skips the gate this session; the record
        // still shows how it cleared.
        let (tx, _rx) = events();
        let outcome = scheduler
            .dispatch(vec![call("c2", "writer")], &context(), &AbortSignal::new(), tx)
            .await;
        assert_eq!(outcome.records[0].state, CallState::Success);
        assert_eq!(
            outcome.records[0].confirmation,
            Some(ConfirmationOutcome::ApprovedRemembered)
        );
        assert_eq!(asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_plain_approval_is_recorded() {
        let scheduler = gated_scheduler_with(vec![Arc::new(TestTool::writer(
            "writer",
            Duration::from_millis(1),
        ))]);
        scheduler.on_confirmation_required(Arc::new(|_req| {
            async {
                ConfirmationDecision {
                    approved: true,
                    remember: false,
                }
            }
            .boxed()
        }));
        let (tx, _rx) = events();
        let outcome = scheduler
            .dispatch(vec![call("c1", "writer")], &context(), &AbortSignal::new(), tx)
            .await;
        assert_eq!(outcome.records[0].state, CallState::Success);
        assert_eq!(
            outcome.records[0].confirmation,
            Some(ConfirmationOutcome::Approved)
        );
    }

    #[tokio::test]
    async fn test_no_handler_rejects_gated_calls() {
        let scheduler = gated_scheduler_with(vec![Arc::new(TestTool::writer(
            "writer",
            Duration::from_millis(1),
        ))]);
        let (tx, _rx) = events();
        let outcome = scheduler
            .dispatch(vec![call("c1", "writer")], &context(), &AbortSignal::new(), tx)
            .await;
        assert_eq!(outcome.records[0].state, CallState::Cancelled);
        assert_eq!(
            outcome.records[0].confirmation,
            Some(ConfirmationOutcome::Rejected)
        );
    }

    #[tokio::test]
    async fn test_timeout_transitions_to_error_with_timeout_kind() {
        let scheduler = scheduler_with(vec![Arc::new(TestTool::reader(
            "slow_reader",
            Duration::from_secs(30),
        ))]);
        let (tx, _rx) = events();

        let mut request = call("c1", "slow_reader");
        request.args = serde_json::json!({"_timeout_ms": 30});
        let outcome = scheduler
            .dispatch(vec![request], &context(), &AbortSignal::new(), tx)
            .await;

        assert_eq!(outcome.records[0].state, CallState::Error);
        match &outcome.responses[0] {
            Part::FunctionResponse { response, .. } => {
                assert_eq!(response["error"]["kind"], "TimeoutError");
            }
            other => panic!("expected function response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_during_awaiting_confirmation() {
        let scheduler = Arc::new(gated_scheduler_with(vec![Arc::new(TestTool::writer(
            "writer",
            Duration::from_millis(1),
        ))]));
        let signal = AbortSignal::new();
        let trip = signal.clone();
        // A handler that never answers; the abort must win.
        scheduler.on_confirmation_required(Arc::new(move |_req| {
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                ConfirmationDecision {
                    approved: true,
                    remember: false,
                }
            }.boxed()
        }));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trip.trip();
        });

        let (tx, _rx) = events();
        let outcome = scheduler
            .dispatch(vec![call("c1", "writer")], &context(), &signal, tx)
            .await;
        assert_eq!(outcome.records[0].state, CallState::Cancelled);
        // The abort pre-empted the handler: no decision was ever made.
        assert_eq!(outcome.records[0].confirmation, None);
    }

    #[tokio::test]
    async fn test_no_execution_starts_after_abort() {
        let reader = Arc::new(TestTool::reader("reader", Duration::from_millis(1)));
        let peak = reader.peak.clone();
        let scheduler = scheduler_with(vec![reader]);
        let signal = AbortSignal::new();
        signal.trip();

        let (tx, _rx) = events();
        let outcome = scheduler
            .dispatch(vec![call("c1", "reader")], &context(), &signal, tx)
            .await;

        assert_eq!(outcome.records[0].state, CallState::Cancelled);
        assert_eq!(peak.load(Ordering::SeqCst), 0, "tool must never run");
    }

    #[tokio::test]
    async fn test_terminal_records_are_immutable() {
        let mut record = ToolCallRecord::new(&call("c1", "reader"));
        record.advance(CallState::Queued);
        record.advance(CallState::Executing);
        record.advance(CallState::Success);
        record.advance(CallState::Error);
        assert_eq!(record.state, CallState::Success);
    }

    #[tokio::test]
    async fn test_scheduler_events_emitted_in_lifecycle_order() {
        let scheduler = scheduler_with(vec![Arc::new(TestTool::reader(
            "reader",
            Duration::from_millis(1),
        ))]);
        let (tx, mut rx) = events();
        scheduler
            .dispatch(vec![call("c1", "reader")], &context(), &AbortSignal::new(), tx)
            .await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                SchedulerEvent::Validating { .. } => "validating",
                SchedulerEvent::AwaitingConfirmation { .. } => "awaiting",
                SchedulerEvent::Running { .. } => "running",
                SchedulerEvent::Finished { .. } => "finished",
                SchedulerEvent::Cancelled { .. } => "cancelled",
            });
        }
        assert_eq!(kinds, vec!["validating", "running", "finished"]);
    }

    #[test]
    fn test_fingerprint_is_key_order_independent() {
        let a = serde_json::json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = serde_json::json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }
}
