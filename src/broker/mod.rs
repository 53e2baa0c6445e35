//! Tool broker: supervised tool-server subprocesses behind one registry.
//!
//! Tools are exposed under `<server>_<tool>`. Server names never contain
//! `_` (enforced by configuration), so the first underscore always splits
//! the namespace from the server's own tool name.
//!
//! ```text
//! call("demo_fetch", args)
//!   ├─ resolve server "demo" and its tool "fetch"
//!   ├─ validate args against the tool's input schema
//!   ├─ wait for a per-server slot (FIFO, bounded by the caller's deadline)
//!   └─ tools/call over the server's JSON-RPC connection
//! ```

pub mod connection;
pub mod protocol;
pub mod schema;
pub mod server;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{BrokerConfig, Config, ToolServerConfig};
use crate::error::{Error, Result, ToolError};
use crate::models::{ToolCall, ToolDescriptor, ToolResult};
use crate::scope::{Scope, DEFAULT_CUSHION};

pub use server::{ManagedServer, ServerState, ServerStatus, SupervisorSettings};

/// Anything that can execute tool calls by qualified name.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Tools currently callable.
    fn tools(&self) -> Vec<ToolDescriptor>;

    async fn call(&self, tool_name: &str, args: Value, scope: &Scope) -> Result<Value, ToolError>;

    /// Run all calls concurrently; results come back in request order and
    /// one failure never cancels the others.
    async fn call_batch(&self, calls: &[ToolCall], scope: &Scope) -> Vec<ToolResult> {
        let futures = calls.iter().map(|c| async move {
            let started = Instant::now();
            let outcome = self.call(&c.tool_name, c.arguments.clone(), scope).await;
            tool_result(&c.id, outcome, started.elapsed())
        });
        futures::future::join_all(futures).await
    }
}

/// Package a call outcome for the model.
pub fn tool_result(
    call_id: &str,
    outcome: Result<Value, ToolError>,
    elapsed: Duration,
) -> ToolResult {
    match outcome {
        Ok(data) => ToolResult {
            call_id: call_id.to_string(),
            success: true,
            data,
            elapsed,
        },
        Err(e) => ToolResult {
            call_id: call_id.to_string(),
            success: false,
            data: json!({"error": e.to_string()}),
            elapsed,
        },
    }
}

pub struct ToolBroker {
    servers: BTreeMap<String, Arc<ManagedServer>>,
}

impl ToolBroker {
    pub fn new(configs: &[ToolServerConfig], broker: &BrokerConfig) -> Self {
        let settings = SupervisorSettings::from(broker);
        let servers = configs
            .iter()
            .map(|c| (c.name.clone(), ManagedServer::new(c.clone(), settings.clone())))
            .collect();
        Self { servers }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.tool_servers, &config.broker)
    }

    /// Start every `auto_start` server. Failures are logged and leave the
    /// server crashed; returns how many are running afterwards.
    pub async fn start_all(&self) -> usize {
        let starts = self
            .servers
            .values()
            .filter(|s| s.config().auto_start)
            .map(|s| async move {
                if let Err(e) = s.start().await {
                    tracing::warn!(server = s.name(), error = %e, "auto-start failed");
                }
            });
        futures::future::join_all(starts).await;
        self.servers
            .values()
            .filter(|s| s.state() == ServerState::Running)
            .count()
    }

    fn server(&self, name: &str) -> Result<&Arc<ManagedServer>> {
        self.servers
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("tool server '{}'", name)))
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        Ok(self.server(name)?.start().await?)
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        Ok(self.server(name)?.restart().await?)
    }

    /// Re-enable a crashed server.
    pub async fn enable(&self, name: &str) -> Result<()> {
        Ok(self.server(name)?.enable().await?)
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.server(name)?.stop().await;
        Ok(())
    }

    pub async fn stop_all(&self) {
        futures::future::join_all(self.servers.values().map(|s| s.stop())).await;
    }

    pub fn server_status(&self) -> Vec<ServerStatus> {
        self.servers.values().map(|s| s.status()).collect()
    }

    /// Union of the tools of every running server, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut out = Vec::new();
        for server in self.servers.values() {
            let Some(session) = server.session() else {
                continue;
            };
            out.extend(session.tools.iter().map(|t| ToolDescriptor {
                server_name: server.name().to_string(),
                tool_name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            }));
        }
        out.sort_by_key(|d| d.qualified_name());
        out
    }

    fn resolve<'a>(&self, qualified: &'a str) -> Result<(&Arc<ManagedServer>, &'a str), ToolError> {
        let unknown = || ToolError::UnknownTool(qualified.to_string());
        let (server, tool) = qualified.split_once('_').ok_or_else(unknown)?;
        let server = self.servers.get(server).ok_or_else(unknown)?;
        Ok((server, tool))
    }
}

#[async_trait]
impl ToolInvoker for ToolBroker {
    fn tools(&self) -> Vec<ToolDescriptor> {
        self.list_tools()
    }

    async fn call(&self, tool_name: &str, args: Value, scope: &Scope) -> Result<Value, ToolError> {
        let (server, tool) = self.resolve(tool_name)?;
        let session = server.session().ok_or_else(|| ToolError::ServerUnavailable {
            server: server.name().to_string(),
        })?;
        let spec = session
            .tools
            .iter()
            .find(|t| t.name == tool)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;
        let args = schema::validate_arguments(&spec.input_schema, &args).map_err(|message| {
            ToolError::InvalidArguments {
                tool: tool_name.to_string(),
                message,
            }
        })?;
        drop(session);

        let timeout = Duration::from_secs(server.config().call_timeout_secs);
        let call_scope = scope
            .child_with_cushion(DEFAULT_CUSHION)
            .child_with_timeout(timeout);
        let started = Instant::now();
        let result = server.call(tool, args, &call_scope).await;
        match &result {
            Ok(_) => tracing::debug!(tool = tool_name, elapsed_ms = started.elapsed().as_millis() as u64, "tool call ok"),
            Err(e) => tracing::info!(tool = tool_name, error = %e, "tool call failed"),
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-process invoker with scripted handlers, for orchestrator and
    /// executor tests.
    pub(crate) struct FakeTools {
        pub descriptors: Vec<ToolDescriptor>,
        pub handler: Box<dyn Fn(&str, &Value) -> Result<Value, ToolError> + Send + Sync>,
        pub delay: Duration,
        pub log: Mutex<Vec<(String, Value)>>,
    }

    impl FakeTools {
        pub(crate) fn new(
            names: &[&str],
            handler: impl Fn(&str, &Value) -> Result<Value, ToolError> + Send + Sync + 'static,
        ) -> Self {
            let descriptors = names
                .iter()
                .map(|n| {
                    let (server, tool) = n.split_once('_').unwrap();
                    ToolDescriptor {
                        server_name: server.to_string(),
                        tool_name: tool.to_string(),
                        description: format!("{} tool", tool),
                        input_schema: json!({"type": "object"}),
                    }
                })
                .collect();
            Self {
                descriptors,
                handler: Box::new(handler),
                delay: Duration::ZERO,
                log: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> Vec<(String, Value)> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolInvoker for FakeTools {
        fn tools(&self) -> Vec<ToolDescriptor> {
            self.descriptors.clone()
        }

        async fn call(&self, tool_name: &str, args: Value, scope: &Scope) -> Result<Value, ToolError> {
            if !self.descriptors.iter().any(|d| d.qualified_name() == tool_name) {
                return Err(ToolError::UnknownTool(tool_name.to_string()));
            }
            self.log.lock().unwrap().push((tool_name.to_string(), args.clone()));
            if !self.delay.is_zero() {
                match scope.run(tokio::time::sleep(self.delay)).await {
                    Ok(()) => {}
                    Err(crate::scope::Interrupted::Cancelled) => return Err(ToolError::Cancelled),
                    Err(crate::scope::Interrupted::DeadlineExceeded) => {
                        return Err(ToolError::Timeout {
                            tool: tool_name.to_string(),
                        })
                    }
                }
            }
            (self.handler)(tool_name, &args)
        }
    }

    #[tokio::test]
    async fn test_call_batch_preserves_order_and_isolates_failures() {
        let tools = FakeTools::new(&["demo_echo", "demo_fail"], |name, args| {
            if name == "demo_fail" {
                Err(ToolError::ExecutionFailed {
                    code: -32000,
                    message: "boom".into(),
                })
            } else {
                Ok(args.clone())
            }
        });
        let calls = vec![
            ToolCall {
                id: "a".into(),
                tool_name: "demo_echo".into(),
                arguments: json!(1),
            },
            ToolCall {
                id: "b".into(),
                tool_name: "demo_fail".into(),
                arguments: json!({}),
            },
            ToolCall {
                id: "c".into(),
                tool_name: "demo_echo".into(),
                arguments: json!(3),
            },
        ];
        let results = tools.call_batch(&calls, &Scope::new(Duration::from_secs(5))).await;
        let ids: Vec<&str> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(results[1].data["error"].as_str().unwrap().contains("boom"));
        assert_eq!(results[2].data, json!(3));
    }

    #[tokio::test]
    async fn test_unknown_and_unavailable() {
        let cfg = ToolServerConfig {
            name: "demo".into(),
            command: "unused".into(),
            args: Vec::new(),
            working_dir: None,
            env: Default::default(),
            auto_start: false,
            restart_on_failure: false,
            max_restarts: 1,
            max_concurrency: 1,
            call_timeout_secs: 1,
        };
        let broker = ToolBroker::new(&[cfg], &BrokerConfig::default());
        let scope = Scope::new(Duration::from_secs(1));

        assert!(matches!(
            broker.call("nounderscore", json!({}), &scope).await,
            Err(ToolError::UnknownTool(_))
        ));
        assert!(matches!(
            broker.call("other_now", json!({}), &scope).await,
            Err(ToolError::UnknownTool(_))
        ));
        assert!(matches!(
            broker.call("demo_now", json!({}), &scope).await,
            Err(ToolError::ServerUnavailable { .. })
        ));
        assert!(broker.list_tools().is_empty());
        assert_eq!(broker.server_status()[0].state, ServerState::Stopped);
        assert!(matches!(broker.restart("missing").await, Err(Error::NotFound(_))));
    }
}
