//! One supervised tool-server subprocess.
//!
//! A [`ManagedServer`] owns the child's lifecycle: spawn and handshake,
//! a supervisor task that restarts the child with exponential backoff when
//! it exits unexpectedly, and the graceful stop sequence (`shutdown`
//! request, SIGTERM, SIGKILL after the grace period). Calls go through a
//! fair semaphore so at most `max_concurrency` are in flight per server.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::connection::{RpcConnection, RpcFailure};
use super::protocol::{
    ClientCapabilities, Framing, InitializeParams, InitializeResult, PeerInfo, ToolCallOutput,
    ToolSpec, ToolsListResult, INTERNAL_ERROR, PROTOCOL_VERSION, TOOL_ERROR,
};
use crate::config::{BrokerConfig, ToolServerConfig};
use crate::error::ToolError;
use crate::scope::{Interrupted, Scope};

const INIT_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const VOLUNTARY_EXIT_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Restarting,
    /// Gave up restarting; stays down until re-enabled.
    Crashed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Restarting => "restarting",
            ServerState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    pub pid: Option<u32>,
    pub tools: usize,
    pub in_flight: usize,
    pub restarts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub window: Duration,
    pub shutdown_grace: Duration,
}

impl From<&BrokerConfig> for SupervisorSettings {
    fn from(c: &BrokerConfig) -> Self {
        Self {
            backoff_base: Duration::from_millis(c.restart_backoff_base_ms),
            backoff_cap: Duration::from_millis(c.restart_backoff_cap_ms),
            window: Duration::from_secs(c.restart_window_secs),
            shutdown_grace: Duration::from_secs(c.shutdown_grace_secs),
        }
    }
}

/// A live, initialised child.
pub struct Session {
    pub conn: RpcConnection,
    pub pid: Option<u32>,
    pub info: InitializeResult,
    pub tools: Vec<ToolSpec>,
}

struct Status {
    state: ServerState,
    last_error: Option<String>,
    restarts: u32,
    history: VecDeque<Instant>,
}

struct Control {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

pub struct ManagedServer {
    config: ToolServerConfig,
    settings: SupervisorSettings,
    session: Mutex<Option<Arc<Session>>>,
    status: Mutex<Status>,
    permits: Arc<Semaphore>,
    control: tokio::sync::Mutex<Control>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl ManagedServer {
    pub fn new(config: ToolServerConfig, settings: SupervisorSettings) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Arc::new(Self {
            config,
            settings,
            session: Mutex::new(None),
            status: Mutex::new(Status {
                state: ServerState::Stopped,
                last_error: None,
                restarts: 0,
                history: VecDeque::new(),
            }),
            permits,
            control: tokio::sync::Mutex::new(Control {
                stop: CancellationToken::new(),
                task: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ToolServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        lock(&self.status).state
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    pub fn status(&self) -> ServerStatus {
        let session = self.session();
        let st = lock(&self.status);
        ServerStatus {
            name: self.config.name.clone(),
            state: st.state,
            pid: session.as_ref().and_then(|s| s.pid),
            tools: session.as_ref().map_or(0, |s| s.tools.len()),
            in_flight: self
                .config
                .max_concurrency
                .max(1)
                .saturating_sub(self.permits.available_permits()),
            restarts: st.restarts,
            last_error: st.last_error.clone(),
        }
    }

    fn set_state(&self, state: ServerState) {
        lock(&self.status).state = state;
    }

    fn record_error(&self, message: String) {
        lock(&self.status).last_error = Some(message);
    }

    fn install(&self, session: Arc<Session>) {
        tracing::info!(
            server = %self.config.name,
            pid = ?session.pid,
            tools = session.tools.len(),
            "tool server running"
        );
        *lock(&self.session) = Some(session);
        self.set_state(ServerState::Running);
    }

    fn take_session(&self) -> Option<Arc<Session>> {
        lock(&self.session).take()
    }

    /// Spawn and initialise the child, then hand it to a supervisor task.
    /// A no-op if a supervisor is already active.
    pub async fn start(self: &Arc<Self>) -> Result<(), ToolError> {
        let mut control = self.control.lock().await;
        if control.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        self.set_state(ServerState::Starting);
        match spawn_session(&self.config).await {
            Ok((session, child)) => {
                self.install(session);
                let stop = CancellationToken::new();
                control.stop = stop.clone();
                control.task = Some(tokio::spawn(Arc::clone(self).supervise(child, stop)));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(server = %self.config.name, error = %e, "tool server failed to start");
                self.record_error(e);
                self.set_state(ServerState::Crashed);
                Err(ToolError::ServerUnavailable {
                    server: self.config.name.clone(),
                })
            }
        }
    }

    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        control.stop.cancel();
        if let Some(task) = control.task.take() {
            let _ = task.await;
        }
        self.take_session();
        if self.state() != ServerState::Crashed {
            self.set_state(ServerState::Stopped);
        }
    }

    pub async fn restart(self: &Arc<Self>) -> Result<(), ToolError> {
        self.stop().await;
        lock(&self.status).history.clear();
        self.start().await
    }

    /// Bring a crashed or stopped server back, resetting its restart budget.
    pub async fn enable(self: &Arc<Self>) -> Result<(), ToolError> {
        match self.state() {
            ServerState::Crashed | ServerState::Stopped => {
                lock(&self.status).history.clear();
                self.start().await
            }
            _ => Ok(()),
        }
    }

    /// Delay before the next restart, or `None` once `max_restarts` restarts
    /// already happened inside the rolling window.
    fn next_backoff(&self) -> Option<Duration> {
        let mut st = lock(&self.status);
        let now = Instant::now();
        while st
            .history
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.settings.window)
        {
            st.history.pop_front();
        }
        if st.history.len() >= self.config.max_restarts as usize {
            return None;
        }
        st.history.push_back(now);
        st.restarts += 1;
        let exponent = (st.history.len() as u32 - 1).min(16);
        let delay = self
            .settings
            .backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.settings.backoff_cap);
        Some(delay.min(self.settings.backoff_cap))
    }

    async fn supervise(self: Arc<Self>, mut child: Child, stop: CancellationToken) {
        let name = self.config.name.clone();
        loop {
            let exit = tokio::select! {
                status = child.wait() => status,
                _ = stop.cancelled() => {
                    self.shutdown_child(&mut child).await;
                    return;
                }
            };
            let reason = match exit {
                Ok(status) => format!("exited with {}", status),
                Err(e) => format!("wait failed: {}", e),
            };
            self.take_session();
            tracing::warn!(server = %name, reason = %reason, "tool server exited");
            self.record_error(reason);

            if !self.config.restart_on_failure {
                self.set_state(ServerState::Crashed);
                return;
            }

            let (session, next_child) = loop {
                let Some(delay) = self.next_backoff() else {
                    tracing::error!(
                        server = %name,
                        max_restarts = self.config.max_restarts,
                        "restart limit reached, marking crashed"
                    );
                    self.set_state(ServerState::Crashed);
                    return;
                };
                self.set_state(ServerState::Restarting);
                tracing::info!(server = %name, delay_ms = delay.as_millis() as u64, "restarting tool server");
                tokio::select! {
                    _ = stop.cancelled() => {
                        self.set_state(ServerState::Stopped);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                match spawn_session(&self.config).await {
                    Ok(pair) => break pair,
                    Err(e) => {
                        tracing::warn!(server = %name, error = %e, "restart attempt failed");
                        self.record_error(e);
                    }
                }
            };
            child = next_child;
            self.install(session);
        }
    }

    async fn shutdown_child(&self, child: &mut Child) {
        let name = &self.config.name;
        if let Some(session) = self.take_session() {
            let scope = Scope::new(SHUTDOWN_REQUEST_TIMEOUT.min(self.settings.shutdown_grace));
            if let Err(e) = session.conn.request("shutdown", json!({}), &scope).await {
                tracing::debug!(server = %name, error = ?e, "shutdown request not acknowledged");
            }
        }

        if tokio::time::timeout(VOLUNTARY_EXIT_WAIT, child.wait()).await.is_err() {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                // SAFETY: plain signal delivery to our own child's pid.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            if tokio::time::timeout(self.settings.shutdown_grace, child.wait())
                .await
                .is_err()
            {
                tracing::warn!(server = %name, "tool server ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }
        self.set_state(ServerState::Stopped);
        tracing::info!(server = %name, "tool server stopped");
    }

    /// Invoke `tool` (unqualified) on this server.
    pub async fn call(&self, tool: &str, args: Value, scope: &Scope) -> Result<Value, ToolError> {
        let qualified = format!("{}_{}", self.config.name, tool);
        let unavailable = || ToolError::ServerUnavailable {
            server: self.config.name.clone(),
        };
        if self.session().is_none() {
            return Err(unavailable());
        }

        let permit = match scope.run(Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(p)) => p,
            Ok(Err(_)) => return Err(unavailable()),
            Err(Interrupted::Cancelled) => return Err(ToolError::Cancelled),
            Err(Interrupted::DeadlineExceeded) => return Err(ToolError::Timeout { tool: qualified }),
        };
        let session = self.session().ok_or_else(unavailable)?;

        tracing::debug!(server = %self.config.name, tool, "tools/call");
        let params = json!({"name": tool, "arguments": args});
        let result = session.conn.request("tools/call", params, scope).await;
        drop(permit);

        match result {
            Ok(value) => {
                let out: ToolCallOutput =
                    serde_json::from_value(value).map_err(|e| ToolError::ExecutionFailed {
                        code: INTERNAL_ERROR,
                        message: format!("malformed tools/call result: {}", e),
                    })?;
                if out.is_error {
                    Err(ToolError::ExecutionFailed {
                        code: TOOL_ERROR,
                        message: content_text(&out.content),
                    })
                } else {
                    Ok(out.content)
                }
            }
            Err(RpcFailure::Closed) => Err(unavailable()),
            Err(RpcFailure::Remote(e)) => Err(ToolError::ExecutionFailed {
                code: e.code,
                message: e.message,
            }),
            Err(RpcFailure::Interrupted { id, reason }) => {
                if session.info.capabilities.cancellation {
                    let _ = session.conn.notify("$/cancel", json!({"id": id})).await;
                }
                match reason {
                    Interrupted::Cancelled => Err(ToolError::Cancelled),
                    Interrupted::DeadlineExceeded => Err(ToolError::Timeout { tool: qualified }),
                }
            }
        }
    }
}

/// Flatten a `content` payload into text: strings as-is, MCP-style
/// `[{type: "text", text}]` arrays joined, anything else as JSON.
pub fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) if items.iter().all(|i| i.get("text").is_some()) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn describe(method: &str, e: RpcFailure) -> String {
    match e {
        RpcFailure::Closed => format!("{}: server closed its output", method),
        RpcFailure::Remote(err) => format!("{}: {} ({})", method, err.message, err.code),
        RpcFailure::Interrupted { .. } => format!("{}: no response within {:?}", method, INIT_TIMEOUT),
    }
}

async fn spawn_session(config: &ToolServerConfig) -> Result<(Arc<Session>, Child), String> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    for (k, v) in &config.env {
        cmd.env(k, v);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn '{}': {}", config.command, e))?;
    let pid = child.id();
    let stdin = child.stdin.take().ok_or_else(|| "stdin not captured".to_string())?;
    let stdout = child.stdout.take().ok_or_else(|| "stdout not captured".to_string())?;
    if let Some(stderr) = child.stderr.take() {
        let name = config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %name, "{}", line);
            }
        });
    }

    let conn = RpcConnection::new(&config.name, stdout, stdin);
    let scope = Scope::new(INIT_TIMEOUT);

    let params = InitializeParams {
        protocol_version: PROTOCOL_VERSION.to_string(),
        client_info: PeerInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        capabilities: ClientCapabilities {
            cancellation: true,
            framing: vec![Framing::Line, Framing::ContentLength],
        },
    };
    let params = serde_json::to_value(&params).map_err(|e| e.to_string())?;
    let init = conn
        .request("initialize", params, &scope)
        .await
        .map_err(|e| describe("initialize", e))?;
    let info: InitializeResult =
        serde_json::from_value(init).map_err(|e| format!("initialize: malformed result: {}", e))?;
    if info.capabilities.framing == Some(Framing::ContentLength) {
        conn.set_framing(Framing::ContentLength);
    }

    let list = conn
        .request("tools/list", json!({}), &scope)
        .await
        .map_err(|e| describe("tools/list", e))?;
    let list: ToolsListResult =
        serde_json::from_value(list).map_err(|e| format!("tools/list: malformed result: {}", e))?;

    tracing::debug!(
        server = %config.name,
        peer = %info.server_info.name,
        framing = ?info.capabilities.framing,
        "handshake complete"
    );
    Ok((
        Arc::new(Session {
            conn,
            pid,
            info,
            tools: list.tools,
        }),
        child,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(command: &str, max_restarts: u32) -> ToolServerConfig {
        ToolServerConfig {
            name: "demo".into(),
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            auto_start: true,
            restart_on_failure: true,
            max_restarts,
            max_concurrency: 2,
            call_timeout_secs: 5,
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings::from(&BrokerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_caps_and_exhausts() {
        let server = ManagedServer::new(config("unused", 7), settings());
        let delays: Vec<u64> = (0..7)
            .map(|_| server.next_backoff().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert!(server.next_backoff().is_none());
        assert_eq!(server.status().restarts, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_window_rolls() {
        let server = ManagedServer::new(config("unused", 2), settings());
        assert!(server.next_backoff().is_some());
        assert!(server.next_backoff().is_some());
        assert!(server.next_backoff().is_none());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(server.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_call_on_stopped_server() {
        let server = ManagedServer::new(config("unused", 1), settings());
        let err = server
            .call("now", json!({}), &Scope::new(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ServerUnavailable { .. }));
        assert_eq!(server.status().state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_crashed() {
        let server = ManagedServer::new(config("/nonexistent/tool-server", 1), settings());
        assert!(server.start().await.is_err());
        let status = server.status();
        assert_eq!(status.state, ServerState::Crashed);
        assert!(status.last_error.unwrap().contains("failed to spawn"));
    }

    #[test]
    fn test_content_text() {
        assert_eq!(content_text(&json!("plain")), "plain");
        assert_eq!(
            content_text(&json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}])),
            "a\nb"
        );
        assert_eq!(content_text(&json!({"k": 1})), "{\"k\":1}");
    }
}
