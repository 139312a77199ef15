//! ACP server infrastructure
//!
//! Hosts the agent over stdio (or arbitrary byte streams, for tests) and
//! over a single-shot HTTP surface. Stream serving runs one connection to
//! completion with a notification forwarder alongside; each HTTP request
//! gets its own connection that lives for exactly one message exchange.

use crate::agent::Agent;
use crate::bridge::AssistantBridge;
use crate::config::AgentConfig;
use crate::extensions::ExtensionRegistry;
use crate::rpc::RpcConnection;
use crate::transport::{HttpTransport, StreamTransport, Transport};
use crate::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal;
use tokio::sync::broadcast;

/// The main ACP server.
pub struct AgentServer {
    config: AgentConfig,
    bridge: Arc<dyn AssistantBridge>,
}

impl AgentServer {
    pub fn new(config: AgentConfig, bridge: Arc<dyn AssistantBridge>) -> Self {
        Self { config, bridge }
    }

    /// Serve one connection over stdio (the standard ACP arrangement).
    pub async fn start_stdio(&self) -> Result<()> {
        tracing::info!("Starting ACP server on stdio");
        self.start_with_streams(tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Serve stdio with SIGINT/SIGTERM shutdown.
    pub async fn start_with_shutdown(&self) -> Result<()> {
        tokio::select! {
            result = self.start_stdio() => result,
            _ = shutdown_signal() => {
                tracing::info!("Received shutdown signal, stopping server");
                Ok(())
            }
        }
    }

    /// Serve one connection over arbitrary streams.
    pub async fn start_with_streams<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let transport: Arc<dyn Transport> = Arc::new(StreamTransport::new(reader, writer));
        let conn = RpcConnection::new(transport, Arc::new(ExtensionRegistry::new()));
        let agent = Agent::new(self.config.clone(), Arc::clone(&self.bridge), &conn)?;
        agent.bind(&conn);

        let forwarder = spawn_notification_forwarder(&agent, &conn);
        let result = Arc::clone(&conn).serve().await;
        forwarder.abort();

        if let Err(e) = agent.shutdown().await {
            tracing::warn!("Error shutting down agent: {}", e);
        }
        tracing::info!("Server connection finished");
        result
    }

    /// Serve the one-shot HTTP surface.
    pub async fn serve_http(&self, addr: SocketAddr) -> Result<()> {
        let state = Arc::new(HttpState {
            config: self.config.clone(),
            bridge: Arc::clone(&self.bridge),
        });
        let app = Router::new()
            .route("/", post(handle_http_rpc).options(handle_preflight))
            .with_state(state);

        tracing::info!("Starting ACP server on http://{}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::AgentError::Transport(format!("HTTP server failed: {}", e)))?;
        Ok(())
    }
}

/// Forward `session/update` notifications from the agent's broadcast
/// channel onto the connection, in emission order.
fn spawn_notification_forwarder(
    agent: &Arc<Agent>,
    conn: &Arc<RpcConnection>,
) -> tokio::task::JoinHandle<()> {
    let mut updates = agent.tool_calls().subscribe();
    let conn = Arc::clone(conn);
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(notification) => {
                    let params = match serde_json::to_value(&notification) {
                        Ok(params) => params,
                        Err(e) => {
                            tracing::error!("Failed to serialize session update: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = conn.notify("session/update", params).await {
                        tracing::error!("Failed to send session update: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Notification forwarder lagged, {} update(s) lost", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                return std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to wait for Ctrl+C: {}", e);
                }
                tracing::info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to wait for Ctrl+C: {}", e);
        }
        tracing::info!("Received Ctrl+C");
    }
}

struct HttpState {
    config: AgentConfig,
    bridge: Arc<dyn AssistantBridge>,
}

impl HttpState {
    /// Run one request body through a fresh connection. `Ok(Some)` is a
    /// response body, `Ok(None)` a notification-only turn.
    async fn handle_one(&self, body: &[u8]) -> Result<Option<Value>> {
        let (transport, response_rx) = HttpTransport::new(body)?;
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let conn = RpcConnection::new(Arc::clone(&transport), Arc::new(ExtensionRegistry::new()));
        let agent = Agent::new(self.config.clone(), Arc::clone(&self.bridge), &conn)?;
        agent.bind(&conn);

        // Exactly one inbound message; dispatch it to completion, then
        // close the writable side so a notification-only turn resolves as
        // "no content".
        if let Some(Ok(message)) = transport.recv().await {
            Arc::clone(&conn).dispatch(message).await;
        }
        transport.close();

        match response_rx.await {
            Ok(response) => Ok(Some(response)),
            Err(_) => Ok(None),
        }
    }
}

fn cors_headers() -> [(header::HeaderName, &'static str); 2] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, "content-type"),
    ]
}

async fn handle_preflight() -> Response {
    (StatusCode::NO_CONTENT, cors_headers()).into_response()
}

async fn handle_http_rpc(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    match state.handle_one(&body).await {
        Ok(Some(response)) => {
            (StatusCode::OK, cors_headers(), axum::Json(response)).into_response()
        }
        Ok(None) => (StatusCode::NO_CONTENT, cors_headers()).into_response(),
        Err(e) => {
            tracing::error!("HTTP transport failure: {}", e);
            let envelope = json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": {"code": -32603, "message": e.to_string()},
            });
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                cors_headers(),
                axum::Json(envelope),
            )
                .into_response()
        }
    }
}
