//! Tool broker against the bundled demo server, spawned as a real
//! subprocess.

use serde_json::json;
use std::time::Duration;

use context_agent::broker::protocol::TOOL_ERROR;
use context_agent::broker::{ServerState, ToolBroker, ToolInvoker};
use context_agent::config::parse_config;
use context_agent::error::ToolError;
use context_agent::models::ToolCall;
use context_agent::scope::Scope;

fn demo_server() -> &'static str {
    env!("CARGO_BIN_EXE_tp-demo-server")
}

fn broker_with(server_toml: &str) -> ToolBroker {
    let toml = format!(
        r#"[db]
path = "/unused.sqlite"

[broker]
restart_backoff_base_ms = 50
restart_backoff_cap_ms = 200
shutdown_grace_secs = 2

[[tool_servers]]
name = "demo"
command = "{}"
{}
"#,
        demo_server(),
        server_toml
    );
    ToolBroker::from_config(&parse_config(&toml).unwrap())
}

fn scope() -> Scope {
    Scope::new(Duration::from_secs(10))
}

async fn wait_for_state(broker: &ToolBroker, state: ServerState) {
    for _ in 0..100 {
        if broker.server_status()[0].state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "server never reached {:?}; status: {:?}",
        state,
        broker.server_status()
    );
}

#[tokio::test]
async fn test_lists_and_calls_tools() {
    let broker = broker_with("");
    assert_eq!(broker.start_all().await, 1);

    let names: Vec<String> = broker.list_tools().iter().map(|t| t.qualified_name()).collect();
    for tool in ["demo_combine", "demo_crash", "demo_echo", "demo_fetch", "demo_now", "demo_sleep"] {
        assert!(names.contains(&tool.to_string()), "missing {}", tool);
    }

    let out = broker.call("demo_echo", json!({"text": "hello"}), &scope()).await.unwrap();
    assert_eq!(out, json!("hello"));

    let now = broker.call("demo_now", json!({}), &scope()).await.unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(now.as_str().unwrap()).is_ok());

    broker.stop_all().await;
    assert_eq!(broker.server_status()[0].state, ServerState::Stopped);
}

#[tokio::test]
async fn test_content_length_framing() {
    let broker = broker_with(r#"args = ["--content-length"]"#);
    broker.start_all().await;

    let out = broker
        .call("demo_combine", json!({"a": "left", "b": "right"}), &scope())
        .await
        .unwrap();
    assert_eq!(out, json!("left+right"));
    broker.stop_all().await;
}

#[tokio::test]
async fn test_call_errors() {
    let broker = broker_with("");
    broker.start_all().await;

    let err = broker.call("demo_echo", json!({}), &scope()).await.unwrap_err();
    assert!(matches!(err, ToolError::InvalidArguments { .. }), "{:?}", err);

    let err = broker.call("demo_missing", json!({}), &scope()).await.unwrap_err();
    assert!(matches!(err, ToolError::UnknownTool(_)));
    let err = broker.call("other_echo", json!({}), &scope()).await.unwrap_err();
    assert!(matches!(err, ToolError::UnknownTool(_)));

    let err = broker
        .call("demo_fetch", json!({"url": "https://example.com/fail", "delay_ms": 1}), &scope())
        .await
        .unwrap_err();
    match err {
        ToolError::ExecutionFailed { code, message } => {
            assert_eq!(code, TOOL_ERROR);
            assert!(message.contains("cannot fetch"));
        }
        other => panic!("unexpected {:?}", other),
    }
    broker.stop_all().await;
}

#[tokio::test]
async fn test_call_batch_keeps_request_order() {
    let broker = broker_with("");
    broker.start_all().await;

    let calls = vec![
        ToolCall {
            id: "slow".into(),
            tool_name: "demo_fetch".into(),
            arguments: json!({"url": "https://x/slow", "delay_ms": 200}),
        },
        ToolCall {
            id: "bad".into(),
            tool_name: "demo_fetch".into(),
            arguments: json!({"url": "https://x/fail", "delay_ms": 1}),
        },
        ToolCall {
            id: "fast".into(),
            tool_name: "demo_echo".into(),
            arguments: json!({"text": "quick"}),
        },
    ];
    let results = broker.call_batch(&calls, &scope()).await;
    let ids: Vec<&str> = results.iter().map(|r| r.call_id.as_str()).collect();
    assert_eq!(ids, ["slow", "bad", "fast"]);
    assert!(results[0].success);
    assert!(!results[1].success);
    assert_eq!(results[2].data, json!("quick"));
    broker.stop_all().await;
}

#[tokio::test]
async fn test_timeout_cancels_call_and_server_stays_usable() {
    let broker = broker_with("call_timeout_secs = 1");
    broker.start_all().await;

    let err = broker
        .call("demo_sleep", json!({"ms": 5000}), &scope())
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Timeout { .. }), "{:?}", err);

    let out = broker.call("demo_echo", json!({"text": "still here"}), &scope()).await.unwrap();
    assert_eq!(out, json!("still here"));
    assert_eq!(broker.server_status()[0].restarts, 0);
    broker.stop_all().await;
}

#[tokio::test]
async fn test_cancelled_scope_cancels_call() {
    let broker = broker_with("");
    broker.start_all().await;

    let scope = scope();
    let canceller = scope.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let err = broker
        .call("demo_sleep", json!({"ms": 5000}), &scope)
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Cancelled));
    broker.stop_all().await;
}

#[tokio::test]
async fn test_crash_mid_call_restarts_server() {
    let broker = broker_with("");
    broker.start_all().await;

    let err = broker.call("demo_crash", json!({}), &scope()).await.unwrap_err();
    assert!(
        matches!(err, ToolError::ServerUnavailable { .. } | ToolError::Timeout { .. }),
        "{:?}",
        err
    );

    wait_for_state(&broker, ServerState::Running).await;
    let status = &broker.server_status()[0];
    assert!(status.restarts >= 1);
    assert!(status.last_error.is_some());

    let out = broker.call("demo_echo", json!({"text": "back"}), &scope()).await.unwrap();
    assert_eq!(out, json!("back"));
    broker.stop_all().await;
}

#[tokio::test]
async fn test_restart_limit_marks_crashed_until_enabled() {
    let broker = broker_with("max_restarts = 1");
    broker.start_all().await;

    let _ = broker.call("demo_crash", json!({}), &scope()).await;
    wait_for_state(&broker, ServerState::Running).await;
    let _ = broker.call("demo_crash", json!({}), &scope()).await;
    wait_for_state(&broker, ServerState::Crashed).await;

    let err = broker.call("demo_echo", json!({"text": "x"}), &scope()).await.unwrap_err();
    assert!(matches!(err, ToolError::ServerUnavailable { .. }));
    assert!(broker.list_tools().is_empty());

    broker.enable("demo").await.unwrap();
    assert_eq!(broker.server_status()[0].state, ServerState::Running);
    let out = broker.call("demo_echo", json!({"text": "again"}), &scope()).await.unwrap();
    assert_eq!(out, json!("again"));
    broker.stop_all().await;
}

#[tokio::test]
async fn test_missing_binary_is_crashed() {
    let toml = r#"[db]
path = "/unused.sqlite"

[[tool_servers]]
name = "ghost"
command = "/definitely/not/a/real/binary"
"#;
    let broker = ToolBroker::from_config(&parse_config(toml).unwrap());
    assert_eq!(broker.start_all().await, 0);
    let status = &broker.server_status()[0];
    assert_eq!(status.state, ServerState::Crashed);
    assert!(status.last_error.is_some());

    let err = broker.call("ghost_echo", json!({}), &scope()).await.unwrap_err();
    assert!(matches!(err, ToolError::ServerUnavailable { .. }));
}
