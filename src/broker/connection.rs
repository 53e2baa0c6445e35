//! JSON-RPC client connection over a byte stream pair.
//!
//! A writer task serialises outgoing messages in the current framing; a
//! reader task routes responses to waiting callers by id. When the peer's
//! output closes, every pending call fails with [`RpcFailure::Closed`].

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::{read_message, Framing, RpcError, RpcMessage};
use crate::scope::{Interrupted, Scope};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcMessage>>>>;

#[derive(Debug, Clone, PartialEq)]
pub enum RpcFailure {
    /// The peer went away before answering.
    Closed,
    Remote(RpcError),
    /// The caller's scope ended first; `id` identifies the abandoned request.
    Interrupted { id: u64, reason: Interrupted },
}

pub struct RpcConnection {
    name: String,
    outgoing: mpsc::Sender<RpcMessage>,
    content_length: Arc<AtomicBool>,
    pending: Pending,
    next_id: AtomicU64,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

fn lock(p: &Pending) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<RpcMessage>>> {
    p.lock().unwrap_or_else(|e| e.into_inner())
}

impl RpcConnection {
    pub fn new<R, W>(name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();
        let content_length = Arc::new(AtomicBool::new(false));
        let (outgoing, mut rx) = mpsc::channel::<RpcMessage>(64);

        {
            let name = name.to_string();
            let content_length = Arc::clone(&content_length);
            let closed = closed.clone();
            let mut writer = writer;
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    let body = match serde_json::to_vec(&msg) {
                        Ok(b) => b,
                        Err(e) => {
                            tracing::error!(server = %name, error = %e, "cannot serialise message");
                            continue;
                        }
                    };
                    let framing = if content_length.load(Ordering::SeqCst) {
                        Framing::ContentLength
                    } else {
                        Framing::Line
                    };
                    let frame = framing.encode(&body);
                    if let Err(e) = writer.write_all(&frame).await {
                        tracing::debug!(server = %name, error = %e, "write to tool server failed");
                        closed.cancel();
                        break;
                    }
                    if writer.flush().await.is_err() {
                        closed.cancel();
                        break;
                    }
                }
            });
        }

        let reader = {
            let name = name.to_string();
            let pending = Arc::clone(&pending);
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(reader);
                loop {
                    match read_message(&mut reader).await {
                        Ok(Some((_, data))) => match serde_json::from_slice::<RpcMessage>(&data) {
                            Ok(msg) if msg.is_response() => {
                                let waiter = msg.id.and_then(|id| lock(&pending).remove(&id));
                                match waiter {
                                    Some(tx) => {
                                        let _ = tx.send(msg);
                                    }
                                    None => {
                                        tracing::debug!(server = %name, id = ?msg.id, "response for unknown id");
                                    }
                                }
                            }
                            Ok(msg) => {
                                tracing::debug!(server = %name, method = ?msg.method, "ignoring server-initiated message");
                            }
                            Err(e) => {
                                tracing::warn!(server = %name, error = %e, "malformed message from tool server");
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(server = %name, error = %e, "read from tool server failed");
                            break;
                        }
                    }
                }
                // Mark closed before dropping waiters so late registrations see it.
                closed.cancel();
                lock(&pending).clear();
            })
        };

        Self {
            name: name.to_string(),
            outgoing,
            content_length,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader,
        }
    }

    pub fn set_framing(&self, framing: Framing) {
        self.content_length
            .store(framing == Framing::ContentLength, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send a request and wait for its response within `scope`.
    pub async fn request(&self, method: &str, params: Value, scope: &Scope) -> Result<Value, RpcFailure> {
        if self.is_closed() {
            return Err(RpcFailure::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        if self.is_closed() {
            lock(&self.pending).remove(&id);
            return Err(RpcFailure::Closed);
        }

        tracing::trace!(server = %self.name, id, method, "rpc request");
        if self
            .outgoing
            .send(RpcMessage::request(id, method, params))
            .await
            .is_err()
        {
            lock(&self.pending).remove(&id);
            return Err(RpcFailure::Closed);
        }

        match scope.run(rx).await {
            Ok(Ok(msg)) => msg.into_result().map_err(RpcFailure::Remote),
            Ok(Err(_)) => Err(RpcFailure::Closed),
            Err(reason) => {
                lock(&self.pending).remove(&id);
                Err(RpcFailure::Interrupted { id, reason })
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcFailure> {
        self.outgoing
            .send(RpcMessage::notification(method, params))
            .await
            .map_err(|_| RpcFailure::Closed)
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::protocol::{read_message, METHOD_NOT_FOUND};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};

    /// Minimal peer: echoes `params` for `echo`, ignores `hang`, errors otherwise.
    fn spawn_peer(server: DuplexStream) -> JoinHandle<Vec<(Framing, RpcMessage)>> {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut reader = BufReader::new(read);
            let mut seen = Vec::new();
            while let Ok(Some((framing, data))) = read_message(&mut reader).await {
                let msg: RpcMessage = serde_json::from_slice(&data).unwrap();
                seen.push((framing, msg.clone()));
                let Some(id) = msg.id else { continue };
                let reply = match msg.method.as_deref() {
                    Some("echo") => RpcMessage::response(id, msg.params.unwrap_or_default()),
                    Some("hang") => continue,
                    Some("quit") => break,
                    _ => RpcMessage::error_response(id, METHOD_NOT_FOUND, "unknown"),
                };
                let body = serde_json::to_vec(&reply).unwrap();
                write.write_all(&framing.encode(&body)).await.unwrap();
            }
            seen
        })
    }

    fn pair() -> (RpcConnection, JoinHandle<Vec<(Framing, RpcMessage)>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(client);
        (RpcConnection::new("test", r, w), spawn_peer(server))
    }

    #[tokio::test]
    async fn test_request_response_and_remote_error() {
        let (conn, _peer) = pair();
        let scope = Scope::new(Duration::from_secs(5));
        let v = conn.request("echo", json!({"x": 1}), &scope).await.unwrap();
        assert_eq!(v, json!({"x": 1}));

        match conn.request("nope", json!({}), &scope).await {
            Err(RpcFailure::Remote(e)) => assert_eq!(e.code, METHOD_NOT_FOUND),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_routed_by_id() {
        let (conn, _peer) = pair();
        let scope = Scope::new(Duration::from_secs(5));
        let calls = (0..10).map(|i| conn.request("echo", json!(i), &scope));
        let results = futures::future::join_all(calls).await;
        for (i, r) in results.into_iter().enumerate() {
            assert_eq!(r.unwrap(), json!(i));
        }
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_timeout_reports_request_id() {
        let (conn, _peer) = pair();
        let scope = Scope::new(Duration::from_millis(50));
        match conn.request("hang", json!({}), &scope).await {
            Err(RpcFailure::Interrupted { id, reason }) => {
                assert_eq!(id, 1);
                assert_eq!(reason, Interrupted::DeadlineExceeded);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_peer_exit_fails_pending_calls() {
        let (conn, _peer) = pair();
        let scope = Scope::new(Duration::from_secs(5));
        let pending = conn.request("hang", json!({}), &scope);
        let quit = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            conn.request("quit", json!({}), &scope).await
        };
        let (a, b) = tokio::join!(pending, quit);
        assert_eq!(a, Err(RpcFailure::Closed));
        assert_eq!(b, Err(RpcFailure::Closed));
        assert!(conn.is_closed());
        assert_eq!(
            conn.request("echo", json!(1), &scope).await,
            Err(RpcFailure::Closed)
        );
    }

    #[tokio::test]
    async fn test_framing_switch() {
        let (conn, peer) = pair();
        let scope = Scope::new(Duration::from_secs(5));
        conn.request("echo", json!(1), &scope).await.unwrap();
        conn.set_framing(Framing::ContentLength);
        conn.request("echo", json!(2), &scope).await.unwrap();
        conn.notify("$/cancel", json!({"id": 9})).await.unwrap();
        drop(conn);

        let seen = peer.await.unwrap();
        assert_eq!(seen[0].0, Framing::Line);
        assert_eq!(seen[1].0, Framing::ContentLength);
        assert_eq!(seen[2].1.method.as_deref(), Some("$/cancel"));
        assert!(seen[2].1.id.is_none());
    }
}
