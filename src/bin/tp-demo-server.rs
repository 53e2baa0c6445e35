//! Demo tool server speaking the tool protocol over stdio.
//!
//! Tools: `now`, `echo`, `fetch`, `combine`, `sleep`, `crash`. `fetch`
//! fakes a download: URLs containing `fail` return an error result.
//! `crash` exits the process mid-call. With `--content-length` the server
//! negotiates Content-Length framing at `initialize`.

use clap::Parser;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use context_agent::broker::protocol::{
    read_message, Framing, InitializeResult, PeerInfo, RpcMessage, ServerCapabilities,
    ToolCallOutput, ToolCallParams, ToolSpec, ToolsListResult, INVALID_PARAMS, METHOD_NOT_FOUND,
    PROTOCOL_VERSION, REQUEST_CANCELLED,
};

#[derive(Parser)]
#[command(name = "tp-demo-server", about = "Demo tool server for ctxa", version)]
struct Args {
    /// Negotiate Content-Length framing.
    #[arg(long)]
    content_length: bool,

    /// Do not advertise `$/cancel` support.
    #[arg(long)]
    no_cancel: bool,
}

enum Outgoing {
    Message(RpcMessage),
    /// Applies to every message queued after it.
    Framing(Framing),
}

type Running = Arc<Mutex<HashMap<u64, AbortHandle>>>;

fn lock(running: &Running) -> MutexGuard<'_, HashMap<u64, AbortHandle>> {
    running.lock().unwrap_or_else(|e| e.into_inner())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = tracing_subscriber::EnvFilter::try_from_env("TP_DEMO_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(rx));
    let running: Running = Arc::default();
    let mut reader = BufReader::new(tokio::io::stdin());

    while let Some((_, body)) = read_message(&mut reader).await? {
        let msg: RpcMessage = match serde_json::from_slice(&body) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable message");
                continue;
            }
        };
        let Some(method) = msg.method.clone() else {
            continue;
        };
        tracing::debug!(method = %method, id = ?msg.id, "received");

        match (method.as_str(), msg.id) {
            ("initialize", Some(id)) => {
                let framing = args.content_length.then_some(Framing::ContentLength);
                let result = InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    server_info: PeerInfo {
                        name: "tp-demo-server".into(),
                        version: env!("CARGO_PKG_VERSION").into(),
                    },
                    capabilities: ServerCapabilities {
                        framing,
                        cancellation: !args.no_cancel,
                    },
                };
                let _ = tx.send(Outgoing::Message(RpcMessage::response(id, serde_json::to_value(result)?)));
                if let Some(framing) = framing {
                    let _ = tx.send(Outgoing::Framing(framing));
                }
            }
            ("tools/list", Some(id)) => {
                let result = ToolsListResult { tools: tool_specs() };
                let _ = tx.send(Outgoing::Message(RpcMessage::response(id, serde_json::to_value(result)?)));
            }
            ("tools/call", Some(id)) => {
                let params = msg.params.unwrap_or(Value::Null);
                let tx = tx.clone();
                let tracked = running.clone();
                let mut map = lock(&running);
                let handle = tokio::spawn(async move {
                    let reply = match serde_json::from_value::<ToolCallParams>(params) {
                        Ok(p) => match call_tool(&p.name, &p.arguments).await {
                            Ok(out) => RpcMessage::response(id, serde_json::to_value(out).unwrap_or(Value::Null)),
                            Err(message) => RpcMessage::error_response(id, INVALID_PARAMS, message),
                        },
                        Err(e) => RpcMessage::error_response(id, INVALID_PARAMS, e.to_string()),
                    };
                    lock(&tracked).remove(&id);
                    let _ = tx.send(Outgoing::Message(reply));
                });
                map.insert(id, handle.abort_handle());
            }
            ("$/cancel", _) => {
                let target = msg.params.as_ref().and_then(|p| p["id"].as_u64());
                if let Some(target) = target {
                    if let Some(handle) = lock(&running).remove(&target) {
                        handle.abort();
                        tracing::info!(id = target, "call cancelled");
                        let _ = tx.send(Outgoing::Message(RpcMessage::error_response(
                            target,
                            REQUEST_CANCELLED,
                            "cancelled",
                        )));
                    }
                }
            }
            ("shutdown", Some(id)) => {
                let _ = tx.send(Outgoing::Message(RpcMessage::response(id, Value::Null)));
                break;
            }
            (other, Some(id)) => {
                let _ = tx.send(Outgoing::Message(RpcMessage::error_response(
                    id,
                    METHOD_NOT_FOUND,
                    format!("method not found: {}", other),
                )));
            }
            (_, None) => {}
        }
    }

    for (_, handle) in lock(&running).drain() {
        handle.abort();
    }
    drop(tx);
    let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
    Ok(())
}

async fn write_loop(mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    let mut stdout = tokio::io::stdout();
    let mut framing = Framing::Line;
    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Framing(f) => framing = f,
            Outgoing::Message(msg) => {
                let Ok(body) = serde_json::to_vec(&msg) else {
                    continue;
                };
                if stdout.write_all(&framing.encode(&body)).await.is_err()
                    || stdout.flush().await.is_err()
                {
                    return;
                }
            }
        }
    }
}

fn tool_specs() -> Vec<ToolSpec> {
    let spec = |name: &str, description: &str, schema: Value| ToolSpec {
        name: name.into(),
        description: description.into(),
        input_schema: schema,
    };
    vec![
        spec(
            "now",
            "Current time as an ISO 8601 string",
            json!({"type": "object", "properties": {}, "additionalProperties": false}),
        ),
        spec(
            "echo",
            "Return the given text",
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
        ),
        spec(
            "fetch",
            "Fetch a URL (simulated); URLs containing 'fail' fail",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "delay_ms": {"type": "integer", "default": 20}
                },
                "required": ["url"]
            }),
        ),
        spec(
            "combine",
            "Join two texts with '+'",
            json!({
                "type": "object",
                "properties": {"a": {"type": "string"}, "b": {"type": "string"}},
                "required": ["a", "b"]
            }),
        ),
        spec(
            "sleep",
            "Sleep for the given number of milliseconds",
            json!({"type": "object", "properties": {"ms": {"type": "integer"}}, "required": ["ms"]}),
        ),
        spec(
            "crash",
            "Exit the server process immediately",
            json!({"type": "object", "properties": {}}),
        ),
    ]
}

fn text_output(text: String, is_error: bool) -> ToolCallOutput {
    ToolCallOutput {
        content: Value::String(text),
        is_error,
    }
}

async fn call_tool(name: &str, args: &Value) -> Result<ToolCallOutput, String> {
    let str_arg = |key: &str| {
        args[key]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| format!("'{}' must be a string", key))
    };
    match name {
        "now" => Ok(text_output(chrono::Utc::now().to_rfc3339(), false)),
        "echo" => Ok(text_output(str_arg("text")?, false)),
        "fetch" => {
            let url = str_arg("url")?;
            let delay = args["delay_ms"].as_u64().unwrap_or(20);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if url.contains("fail") {
                Ok(text_output(format!("cannot fetch {}", url), true))
            } else {
                Ok(text_output(format!("content of {}", url), false))
            }
        }
        "combine" => Ok(text_output(format!("{}+{}", str_arg("a")?, str_arg("b")?), false)),
        "sleep" => {
            let ms = args["ms"].as_u64().ok_or("'ms' must be an integer")?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(text_output(format!("slept {}ms", ms), false))
        }
        "crash" => {
            tracing::warn!("crash requested");
            std::process::exit(3);
        }
        other => Err(format!("unknown tool '{}'", other)),
    }
}
