//! End-to-end agent loop tests: mock LLM, real scheduler and tools, real
//! SQLite.

use std::sync::Arc;

use futures::{FutureExt, StreamExt};

use dbrheo::client::{AgentClient, AgentEvent};
use dbrheo::config::AgentConfig;
use dbrheo::connection::ConnectionManager;
use dbrheo::db::{AdapterFactory, DatabaseConfig, QueryOptions, Value};
use dbrheo::llm::{FinishReason, MockLlmService};
use dbrheo::scheduler::ConfirmationDecision;
use dbrheo::tools::{register_builtin_tools, ToolRegistry};
use dbrheo::types::{Part, Role};

/// Builds a client over an in-memory SQLite database seeded with a small
/// `t` table.
async fn seeded_client(mock: MockLlmService, overrides: &str) -> Arc<AgentClient> {
    let config = Arc::new(AgentConfig::for_tests(
        serde_yaml::from_str(overrides).unwrap(),
    ));
    let registry = Arc::new(ToolRegistry::new());
    register_builtin_tools(&registry).unwrap();

    let connections = Arc::new(ConnectionManager::new(Arc::new(AdapterFactory::new())));
    let conn = connections
        .open("main", DatabaseConfig::sqlite(":memory:"), true)
        .await
        .unwrap();
    conn.execute(
        "CREATE TABLE t (a INTEGER, b TEXT)",
        &[],
        &QueryOptions::default(),
    )
    .await
    .unwrap();
    conn.execute(
        "INSERT INTO t VALUES (1, 'x'), (2, 'y'), (3, 'z')",
        &[],
        &QueryOptions::default(),
    )
    .await
    .unwrap();

    AgentClient::new(config, Arc::new(mock), registry, connections, None)
}

async fn collect(client: &Arc<AgentClient>, text: &str) -> Vec<AgentEvent> {
    let mut stream = client.send_message_stream(text);
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_single_select_round_trip() {
    let mock = MockLlmService::new()
        .with_script(MockLlmService::tool_call_reply(
            "c1",
            "sql_tool",
            serde_json::json!({"sql": "SELECT * FROM t LIMIT 2"}),
        ))
        .with_script(MockLlmService::text_reply("Here are the first two rows."));
    let client = seeded_client(mock, "{}").await;

    let events = collect(&client, "show first 2 rows from t").await;

    // A safe SELECT needs no confirmation and succeeds.
    assert!(!events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolAwaitingConfirmation { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolFinished { id, ok: true, .. } if id == "c1")));
    assert!(matches!(
        events.last(),
        Some(AgentEvent::Finish {
            reason: FinishReason::Stop
        })
    ));

    // History ends with the paired call/response plus the closing text.
    let history = client.history_snapshot().await;
    assert_eq!(history[1].call_ids(), vec!["c1"]);
    match &history[2].parts[0] {
        Part::FunctionResponse { id, response, error, .. } => {
            assert_eq!(id, "c1");
            assert!(error.is_none());
            assert_eq!(response["rows"].as_array().unwrap().len(), 2);
            assert_eq!(response["columns"], serde_json::json!(["a", "b"]));
        }
        other => panic!("expected function response, got {other:?}"),
    }
    assert!(dbrheo::chat::Chat::from_history(history).pairing_is_valid());
}

#[tokio::test]
async fn test_destructive_statement_is_gated_and_rejectable() {
    let mock = MockLlmService::new()
        .with_script(MockLlmService::tool_call_reply(
            "c1",
            "sql_tool",
            serde_json::json!({"sql": "DROP TABLE t"}),
        ))
        .with_script(MockLlmService::text_reply(
            "Understood, I will not drop the table.",
        ));
    let client = seeded_client(mock, "{}").await;
    client
        .scheduler()
        .on_confirmation_required(Arc::new(|_request| {
            async {
                ConfirmationDecision {
                    approved: false,
                    remember: false,
                }
            }.boxed()
        }));

    let events = collect(&client, "drop the table t").await;

    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolAwaitingConfirmation { id, .. } if id == "c1")));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolFinished { id, ok: false, .. } if id == "c1")));

    // The rejection reaches the model as a structured error payload, and
    // the table is untouched.
    let history = client.history_snapshot().await;
    match &history[2].parts[0] {
        Part::FunctionResponse { response, .. } => {
            assert_eq!(response["error"]["kind"], "RiskRejectedError");
        }
        other => panic!("expected function response, got {other:?}"),
    }

    let conn = client.connections().current().await.unwrap();
    let count = conn
        .execute("SELECT COUNT(*) FROM t", &[], &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(count.rows[0][0], Value::Int(3));
}

#[tokio::test]
async fn test_parallel_reads_keep_call_order() {
    let mock = MockLlmService::new()
        .with_script(vec![
            dbrheo::llm::StreamEvent::FunctionCall {
                id: "c1".to_string(),
                name: "sql_tool".to_string(),
                args: serde_json::json!({"sql": "SELECT a FROM t ORDER BY a"}),
            },
            dbrheo::llm::StreamEvent::FunctionCall {
                id: "c2".to_string(),
                name: "sql_tool".to_string(),
                args: serde_json::json!({"sql": "SELECT b FROM t ORDER BY b"}),
            },
            dbrheo::llm::StreamEvent::Finish(FinishReason::Stop),
        ])
        .with_script(MockLlmService::text_reply("Both queries are done."));
    let client = seeded_client(mock, "{}").await;

    collect(&client, "run both queries").await;

    let history = client.history_snapshot().await;
    let response_ids: Vec<&str> = history[2]
        .parts
        .iter()
        .filter_map(|p| p.response_id())
        .collect();
    assert_eq!(response_ids, vec!["c1", "c2"]);
}

#[tokio::test]
async fn test_schema_tool_through_the_loop() {
    let mock = MockLlmService::new()
        .with_script(MockLlmService::tool_call_reply(
            "c1",
            "schema_tool",
            serde_json::json!({}),
        ))
        .with_script(MockLlmService::text_reply("The database has one table."));
    let client = seeded_client(mock, "{}").await;

    collect(&client, "what tables exist?").await;

    let history = client.history_snapshot().await;
    match &history[2].parts[0] {
        Part::FunctionResponse { response, error, .. } => {
            assert!(error.is_none());
            assert_eq!(response["tables"][0]["name"], "t");
        }
        other => panic!("expected function response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_user_content_only_after_immediate_interrupt() {
    let mock = MockLlmService::new()
        .with_event_delay(std::time::Duration::from_millis(50))
        .with_script(MockLlmService::text_reply("a slow reply"));
    let client = seeded_client(mock, "{}").await;

    let mut stream = client.send_message_stream("anything");
    client.interrupt();
    let mut last = None;
    while let Some(event) = stream.next().await {
        last = Some(event);
    }

    assert!(matches!(
        last,
        Some(AgentEvent::Finish {
            reason: FinishReason::Aborted
        })
    ));
    let history = client.history_snapshot().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);
}
