//! Client-side filesystem access over the reverse channel
//!
//! The agent never touches the disk itself. File content flows through the
//! client via `fs/read_text_file` and `fs/write_text_file` reverse calls;
//! this module defines the interface the rest of the core programs
//! against, plus the RPC-backed implementation with retry.

use crate::config::FsConfig;
use crate::rpc::RpcConnection;
use crate::{AgentError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Capability set for file access, implemented over the reverse channel in
/// production and by fixtures in tests.
#[async_trait]
pub trait FsClient: Send + Sync {
    async fn read_text_file(
        &self,
        session_id: &str,
        path: &str,
        line: Option<u64>,
        limit: Option<u64>,
    ) -> Result<String>;

    async fn write_text_file(&self, session_id: &str, path: &str, content: &str) -> Result<()>;
}

/// `FsClient` over a live RPC connection.
///
/// Reads retry transient failures with a linear backoff
/// (`retry_delay * attempt`); validation, not-found, and permission
/// failures are raised immediately. Writes are not idempotent and never
/// retried.
pub struct RpcFsClient {
    conn: Arc<RpcConnection>,
    config: FsConfig,
}

impl RpcFsClient {
    pub fn new(conn: Arc<RpcConnection>, config: FsConfig) -> Self {
        Self { conn, config }
    }
}

#[async_trait]
impl FsClient for RpcFsClient {
    async fn read_text_file(
        &self,
        session_id: &str,
        path: &str,
        line: Option<u64>,
        limit: Option<u64>,
    ) -> Result<String> {
        let mut params = json!({"sessionId": session_id, "path": path});
        if let Some(line) = line {
            params["line"] = json!(line);
        }
        if let Some(limit) = limit {
            params["limit"] = json!(limit);
        }

        // Reverse calls are abandoned when their session cancels; a late
        // response is dropped by the multiplexer.
        let cancel = self.conn.cancellations().token_for(session_id);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .conn
                .request_with_cancel("fs/read_text_file", params.clone(), &cancel)
                .await
            {
                Ok(response) => {
                    return response
                        .get("content")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| {
                            AgentError::Protocol(
                                "fs/read_text_file response missing content".to_string(),
                            )
                        });
                }
                Err(e) if e.is_transient() && attempt <= self.config.retries => {
                    tracing::warn!(
                        "fs/read_text_file attempt {} for {} failed, retrying: {}",
                        attempt,
                        path,
                        e
                    );
                    tokio::time::sleep(self.config.retry_delay() * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_text_file(&self, session_id: &str, path: &str, content: &str) -> Result<()> {
        let cancel = self.conn.cancellations().token_for(session_id);
        self.conn
            .request_with_cancel(
                "fs/write_text_file",
                json!({"sessionId": session_id, "path": path, "content": content}),
                &cancel,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::ExtensionRegistry;
    use crate::transport::StreamTransport;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Client side of the duplex pair: answer fs requests from a script of
    /// responses, in order.
    async fn scripted_client(
        stream: tokio::io::DuplexStream,
        responses: Vec<Value>,
    ) -> tokio::task::JoinHandle<()> {
        let (read, mut write) = tokio::io::split(stream);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            let mut responses = responses.into_iter();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let Some(body) = responses.next() else { break };
                let mut frame = body;
                frame["id"] = request["id"].clone();
                frame["jsonrpc"] = json!("2.0");
                let mut line = serde_json::to_string(&frame).unwrap();
                line.push('\n');
                write.write_all(line.as_bytes()).await.unwrap();
            }
        })
    }

    fn connection(stream: tokio::io::DuplexStream) -> Arc<RpcConnection> {
        let (read, write) = tokio::io::split(stream);
        let transport = Arc::new(StreamTransport::new(read, write));
        let conn = RpcConnection::new(transport, Arc::new(ExtensionRegistry::new()));
        tokio::spawn(Arc::clone(&conn).serve());
        conn
    }

    fn quick_config() -> FsConfig {
        FsConfig {
            retries: 3,
            retry_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_read_round_trip() {
        let (client, server) = duplex(4096);
        scripted_client(client, vec![json!({"result": {"content": "hello"}})]).await;

        let fs = RpcFsClient::new(connection(server), quick_config());
        let content = fs
            .read_text_file("sess_1", "/tmp/a.txt", None, None)
            .await
            .unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn test_read_retries_transient_failure() {
        let (client, server) = duplex(4096);
        scripted_client(
            client,
            vec![
                json!({"error": {"code": -32603, "message": "EAGAIN"}}),
                json!({"result": {"content": "second try"}}),
            ],
        )
        .await;

        let fs = RpcFsClient::new(connection(server), quick_config());
        let content = fs
            .read_text_file("sess_1", "/tmp/a.txt", None, None)
            .await
            .unwrap();
        assert_eq!(content, "second try");
    }

    #[tokio::test]
    async fn test_read_does_not_retry_validation_failure() {
        let (client, server) = duplex(4096);
        scripted_client(
            client,
            vec![
                json!({"error": {"code": -32602, "message": "path is required"}}),
                json!({"result": {"content": "never seen"}}),
            ],
        )
        .await;

        let fs = RpcFsClient::new(connection(server), quick_config());
        let err = fs
            .read_text_file("sess_1", "/tmp/a.txt", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_read_exhausts_retry_budget() {
        let (client, server) = duplex(4096);
        let failure = json!({"error": {"code": -32603, "message": "EAGAIN"}});
        scripted_client(
            client,
            vec![failure.clone(), failure.clone(), failure.clone(), failure],
        )
        .await;

        let fs = RpcFsClient::new(connection(server), quick_config());
        let err = fs
            .read_text_file("sess_1", "/tmp/a.txt", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_write_round_trip() {
        let (client, server) = duplex(4096);
        scripted_client(client, vec![json!({"result": {}})]).await;

        let fs = RpcFsClient::new(connection(server), quick_config());
        fs.write_text_file("sess_1", "/tmp/a.txt", "updated")
            .await
            .unwrap();
    }
}
