//! Bidirectional JSON-RPC 2.0 multiplexer
//!
//! One `RpcConnection` carries both directions over a single transport:
//! inbound requests and notifications are routed to registered handlers
//! (or to the extension registry for `_`-prefixed names), while outbound
//! requests park a waiter keyed by a monotonically increasing id and
//! resolve when the matching response arrives. A `session/cancel`
//! notification signals every in-flight handler tagged with that session.

use crate::extensions::ExtensionRegistry;
use crate::transport::Transport;
use crate::{error, AgentError, Result};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Context handed to every inbound method handler.
#[derive(Clone)]
pub struct RequestCtx {
    /// Session id extracted from `params.sessionId`, when present
    pub session_id: Option<String>,
    /// Cancelled when `session/cancel` arrives for this handler's session
    pub cancel: CancellationToken,
}

/// A registered method handler.
pub type MethodHandler =
    Arc<dyn Fn(Value, RequestCtx) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Error object from a peer's response.
#[derive(Debug, Clone)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

type PendingResponse = std::result::Result<Value, RpcErrorObject>;

/// Per-session cancellation tokens.
///
/// `token_for` hands out the session's current token, creating one on
/// first use; `cancel` fires and retires it so later handlers on the same
/// session start fresh.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn token_for(&self, session_id: &str) -> CancellationToken {
        self.tokens
            .lock()
            .expect("cancellation lock poisoned")
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    pub fn cancel(&self, session_id: &str) {
        let token = self
            .tokens
            .lock()
            .expect("cancellation lock poisoned")
            .remove(session_id);
        if let Some(token) = token {
            token.cancel();
        }
    }

    pub fn cancel_all(&self) {
        let tokens: Vec<_> = {
            let mut map = self.tokens.lock().expect("cancellation lock poisoned");
            map.drain().map(|(_, token)| token).collect()
        };
        for token in tokens {
            token.cancel();
        }
    }
}

/// A JSON-RPC 2.0 connection over one transport.
pub struct RpcConnection {
    transport: Arc<dyn Transport>,
    handlers: RwLock<HashMap<String, MethodHandler>>,
    extensions: Arc<ExtensionRegistry>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<PendingResponse>>>,
    cancellations: CancellationRegistry,
}

fn result_frame(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error_frame(id: Value, code: i64, message: String) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

impl RpcConnection {
    pub fn new(transport: Arc<dyn Transport>, extensions: Arc<ExtensionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            handlers: RwLock::new(HashMap::new()),
            extensions,
            next_id: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
            cancellations: CancellationRegistry::default(),
        })
    }

    /// Register a handler for an inbound method or notification name.
    pub fn register_method(&self, name: impl Into<String>, handler: MethodHandler) {
        self.handlers
            .write()
            .expect("handlers lock poisoned")
            .insert(name.into(), handler);
    }

    pub fn extensions(&self) -> &Arc<ExtensionRegistry> {
        &self.extensions
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Send a request to the peer and await the correlated response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.request_inner(method, params, None).await
    }

    /// Like [`request`](Self::request), but abandoned when the token
    /// fires: the waiter is removed and a late response is dropped.
    pub async fn request_with_cancel(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.request_inner(method, params, Some(cancel)).await
    }

    async fn request_inner(
        &self,
        method: &str,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);

        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        if let Err(e) = self.transport.send(frame).await {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            return Err(e);
        }

        let outcome = match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        self.pending
                            .lock()
                            .expect("pending lock poisoned")
                            .remove(&id);
                        return Err(AgentError::Cancelled);
                    }
                    outcome = rx => outcome,
                }
            }
            None => rx.await,
        };

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(match err.code {
                error::INVALID_PARAMS => AgentError::InvalidParams(err.message),
                error::METHOD_NOT_FOUND => AgentError::MethodNotFound(err.message),
                _ => AgentError::Protocol(format!("RPC error {}: {}", err.code, err.message)),
            }),
            Err(_) => Err(AgentError::Transport("Connection closed".to_string())),
        }
    }

    /// Send a notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.transport
            .send(json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await
    }

    /// Drive the connection until the transport closes.
    ///
    /// Each inbound message is dispatched on its own task; outstanding
    /// outbound waiters are failed when the loop ends.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        loop {
            match self.transport.recv().await {
                None => break,
                Some(Err(e)) => {
                    tracing::error!("Transport framing failure: {}", e);
                    continue;
                }
                Some(Ok(message)) => {
                    let conn = Arc::clone(&self);
                    tokio::spawn(async move {
                        conn.dispatch(message).await;
                    });
                }
            }
        }

        // Peer is gone: every parked waiter resolves as closed and every
        // session token fires.
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .clear();
        self.cancellations.cancel_all();
        tracing::debug!("RPC connection finished");
        Ok(())
    }

    /// Route one already-parsed frame. The serve loop spawns this per
    /// message; the one-shot HTTP surface awaits it directly.
    pub(crate) async fn dispatch(self: Arc<Self>, message: Value) {
        if message.get("method").is_some() {
            self.dispatch_inbound(message).await;
        } else if message.get("result").is_some() || message.get("error").is_some() {
            self.dispatch_response(message);
        } else if let Some(id) = message.get("id") {
            let frame = error_frame(
                id.clone(),
                error::INVALID_REQUEST,
                "Invalid request: expected method or response".to_string(),
            );
            if let Err(e) = self.transport.send(frame).await {
                tracing::error!("Failed to send error response: {}", e);
            }
        } else {
            tracing::warn!("Dropping unrecognized frame");
        }
    }

    async fn dispatch_inbound(self: &Arc<Self>, message: Value) {
        let id = message.get("id").cloned();
        let method = match message.get("method").and_then(Value::as_str) {
            Some(method) => method.to_string(),
            None => {
                if let Some(id) = id {
                    let frame = error_frame(
                        id,
                        error::INVALID_REQUEST,
                        "Invalid request: method must be a string".to_string(),
                    );
                    let _ = self.transport.send(frame).await;
                }
                return;
            }
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        // Cancellation is signalled before the handler runs so that
        // in-flight work observes it as early as possible.
        if method == "session/cancel" {
            if let Some(session_id) = params.get("sessionId").and_then(Value::as_str) {
                tracing::info!("Cancelling session: {}", session_id);
                self.cancellations.cancel(session_id);
            }
        }

        let handler = self
            .handlers
            .read()
            .expect("handlers lock poisoned")
            .get(&method)
            .cloned();

        match handler {
            Some(handler) => {
                let session_id = params
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let cancel = session_id
                    .as_deref()
                    .map(|sid| self.cancellations.token_for(sid))
                    .unwrap_or_default();
                let ctx = RequestCtx {
                    session_id,
                    cancel,
                };

                let outcome = handler(params, ctx).await;
                match (id, outcome) {
                    (Some(id), Ok(result)) => {
                        let _ = self.transport.send(result_frame(id, result)).await;
                    }
                    (Some(id), Err(e)) => {
                        let frame = error_frame(id, e.json_rpc_code(), e.to_string());
                        let _ = self.transport.send(frame).await;
                    }
                    (None, Ok(_)) => {}
                    (None, Err(e)) => {
                        tracing::warn!("Notification handler for {} failed: {}", method, e);
                    }
                }
            }
            None if method.starts_with('_') => {
                self.dispatch_extension(&method, id, params).await;
            }
            None => match id {
                Some(id) => {
                    tracing::warn!("Unknown method: {}", method);
                    let frame = error_frame(
                        id,
                        error::METHOD_NOT_FOUND,
                        format!("Method not found: {}", method),
                    );
                    let _ = self.transport.send(frame).await;
                }
                None => {
                    tracing::warn!("Dropping notification for unknown method: {}", method);
                }
            },
        }
    }

    async fn dispatch_extension(&self, method: &str, id: Option<Value>, params: Value) {
        match id {
            Some(id) => {
                let frame = match self.extensions.invoke_method(method, params).await {
                    Ok(result) => result_frame(id, result),
                    Err(e) => error_frame(id, e.json_rpc_code(), e.to_string()),
                };
                let _ = self.transport.send(frame).await;
            }
            None => {
                self.extensions.deliver_notification(method, params).await;
            }
        }
    }

    fn dispatch_response(&self, message: Value) {
        let id = match message.get("id").and_then(Value::as_i64) {
            Some(id) => id,
            None => {
                tracing::warn!("Dropping response without a usable id");
                return;
            }
        };

        let waiter = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id);
        let Some(waiter) = waiter else {
            // Abandoned by cancellation, or the peer invented an id.
            tracing::debug!("Dropping response for unknown request id {}", id);
            return;
        };

        let outcome = if let Some(error_value) = message.get("error") {
            Err(RpcErrorObject {
                code: error_value
                    .get("code")
                    .and_then(Value::as_i64)
                    .unwrap_or(error::INTERNAL_ERROR),
                message: error_value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
                data: error_value.get("data").cloned(),
            })
        } else {
            Ok(message.get("result").cloned().unwrap_or(Value::Null))
        };

        let _ = waiter.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamTransport;
    use futures::FutureExt;
    use serde_json::json;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct Harness {
        conn: Arc<RpcConnection>,
        client_write: tokio::io::WriteHalf<tokio::io::DuplexStream>,
        client_lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    }

    fn harness() -> Harness {
        let (client, server) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let transport = Arc::new(StreamTransport::new(server_read, server_write));
        let conn = RpcConnection::new(transport, Arc::new(ExtensionRegistry::new()));
        tokio::spawn(Arc::clone(&conn).serve());

        Harness {
            conn,
            client_write,
            client_lines: BufReader::new(client_read).lines(),
        }
    }

    impl Harness {
        async fn send(&mut self, frame: Value) {
            let mut line = serde_json::to_string(&frame).unwrap();
            line.push('\n');
            self.client_write.write_all(line.as_bytes()).await.unwrap();
        }

        async fn next(&mut self) -> Value {
            let line = self.client_lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn test_unknown_method_yields_method_not_found() {
        let mut h = harness();
        h.send(json!({"jsonrpc": "2.0", "id": 1, "method": "no/such"}))
            .await;

        let response = h.next().await;
        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], 1);
        assert_eq!(response["error"]["code"], -32601);
        assert!(response.get("result").is_none());
    }

    #[tokio::test]
    async fn test_registered_handler_round_trip() {
        let mut h = harness();
        h.conn.register_method(
            "math/add",
            Arc::new(|params: Value, _ctx| {
                async move {
                    let a = params["a"].as_i64().unwrap_or(0);
                    let b = params["b"].as_i64().unwrap_or(0);
                    Ok(json!({"sum": a + b}))
                }
                .boxed()
            }),
        );

        h.send(json!({"jsonrpc": "2.0", "id": 2, "method": "math/add", "params": {"a": 2, "b": 3}}))
            .await;

        let response = h.next().await;
        assert_eq!(response["id"], 2);
        assert_eq!(response["result"]["sum"], 5);
        assert!(response.get("error").is_none());
    }

    #[tokio::test]
    async fn test_handler_error_maps_to_code() {
        let mut h = harness();
        h.conn.register_method(
            "always/invalid",
            Arc::new(|_params, _ctx| {
                async { Err(AgentError::InvalidParams("cwd must be a string".to_string())) }
                    .boxed()
            }),
        );
        h.conn.register_method(
            "always/broken",
            Arc::new(|_params, _ctx| {
                async { Err(AgentError::Protocol("wires crossed".to_string())) }.boxed()
            }),
        );

        h.send(json!({"jsonrpc": "2.0", "id": 3, "method": "always/invalid"}))
            .await;
        let response = h.next().await;
        assert_eq!(response["error"]["code"], -32602);
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("cwd must be a string"));

        h.send(json!({"jsonrpc": "2.0", "id": 4, "method": "always/broken"}))
            .await;
        let response = h.next().await;
        assert_eq!(response["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn test_outbound_request_correlation() {
        let mut h = harness();

        let conn = Arc::clone(&h.conn);
        let request = tokio::spawn(async move {
            conn.request("fs/read_text_file", json!({"path": "/tmp/a.txt"}))
                .await
        });

        let frame = h.next().await;
        assert_eq!(frame["method"], "fs/read_text_file");
        let id = frame["id"].clone();

        h.send(json!({"jsonrpc": "2.0", "id": id, "result": {"content": "hello"}}))
            .await;

        let result = request.await.unwrap().unwrap();
        assert_eq!(result["content"], "hello");
    }

    #[tokio::test]
    async fn test_outbound_request_error_response() {
        let mut h = harness();

        let conn = Arc::clone(&h.conn);
        let request =
            tokio::spawn(async move { conn.request("fs/read_text_file", json!({})).await });

        let frame = h.next().await;
        let id = frame["id"].clone();
        h.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32602, "message": "path is required"}
        }))
        .await;

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_cancelled_request_drops_late_response() {
        let mut h = harness();

        let token = CancellationToken::new();
        let conn = Arc::clone(&h.conn);
        let request_token = token.clone();
        let request = tokio::spawn(async move {
            conn.request_with_cancel("slow/thing", json!({}), &request_token)
                .await
        });

        let frame = h.next().await;
        let id = frame["id"].clone();

        token.cancel();
        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));

        // Late response for the abandoned id must be silently dropped,
        // not crash the dispatch loop.
        h.send(json!({"jsonrpc": "2.0", "id": id, "result": {"late": true}}))
            .await;
        h.send(json!({"jsonrpc": "2.0", "id": 99, "method": "no/such"}))
            .await;
        let response = h.next().await;
        assert_eq!(response["id"], 99);
    }

    #[tokio::test]
    async fn test_session_cancel_signals_inflight_handler() {
        let mut h = harness();

        h.conn.register_method(
            "slow/work",
            Arc::new(|_params, ctx: RequestCtx| {
                async move {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => Ok(json!({"cancelled": true})),
                        _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {
                            Ok(json!({"cancelled": false}))
                        }
                    }
                }
                .boxed()
            }),
        );

        h.send(json!({
            "jsonrpc": "2.0", "id": 5, "method": "slow/work",
            "params": {"sessionId": "sess_1"}
        }))
        .await;
        // Let the handler park before cancelling.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        h.send(json!({
            "jsonrpc": "2.0", "method": "session/cancel",
            "params": {"sessionId": "sess_1"}
        }))
        .await;

        let response = h.next().await;
        assert_eq!(response["id"], 5);
        assert_eq!(response["result"]["cancelled"], true);
    }

    #[tokio::test]
    async fn test_extension_routing() {
        let mut h = harness();
        h.conn
            .extensions()
            .register_method(
                "_app/foo",
                Box::new(|params| async move { Ok(json!({"got": params})) }.boxed()),
            )
            .unwrap();

        h.send(json!({"jsonrpc": "2.0", "id": 6, "method": "_app/foo", "params": {"k": 1}}))
            .await;
        let response = h.next().await;
        assert_eq!(response["result"]["got"]["k"], 1);

        h.conn.extensions().unregister_method("_app/foo");
        h.send(json!({"jsonrpc": "2.0", "id": 7, "method": "_app/foo"}))
            .await;
        let response = h.next().await;
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_invalid_request_frame() {
        let mut h = harness();
        h.send(json!({"jsonrpc": "2.0", "id": 8})).await;

        let response = h.next().await;
        assert_eq!(response["id"], 8);
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn test_notification_handler_failure_is_swallowed() {
        let mut h = harness();
        h.conn.register_method(
            "flaky/notify",
            Arc::new(|_params, _ctx| {
                async { Err(AgentError::Protocol("oops".to_string())) }.boxed()
            }),
        );

        h.send(json!({"jsonrpc": "2.0", "method": "flaky/notify"}))
            .await;
        // Still serving afterwards.
        h.send(json!({"jsonrpc": "2.0", "id": 9, "method": "no/such"}))
            .await;
        let response = h.next().await;
        assert_eq!(response["id"], 9);
    }
}
