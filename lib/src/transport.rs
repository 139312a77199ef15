//! Message transports for the JSON-RPC channel
//!
//! Two transports share one message shape: a stream transport carrying one
//! JSON object per newline-terminated UTF-8 line, and a single-shot HTTP
//! transport carrying one inbound message and at most one outbound message.
//! The multiplexer only ever sees whole parsed values; framing failures
//! surface as transport errors here.

use crate::{AgentError, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Inbound messages buffered ahead of the consumer. Lines that arrive
/// before anyone calls `recv` wait here rather than being dropped.
const INBOUND_BUFFER: usize = 256;

/// Outbound frames queued for the single writer task. When the writer
/// cannot keep up, senders block on the channel.
const OUTBOUND_BUFFER: usize = 64;

/// A bidirectional message transport.
///
/// `recv` yields whole inbound JSON values (or a framing error) until the
/// peer goes away; `send` enqueues one outbound value, resolving once the
/// frame has been written. Writes are atomic per message: two concurrent
/// senders never interleave bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Next inbound message; `None` once the channel is closed.
    async fn recv(&self) -> Option<Result<Value>>;

    /// Write one outbound message.
    async fn send(&self, message: Value) -> Result<()>;

    /// Stop both directions. Idempotent.
    fn close(&self);
}

struct OutboundFrame {
    line: String,
    done: oneshot::Sender<Result<()>>,
}

/// Newline-delimited JSON over an arbitrary byte stream (stdio in
/// production, `tokio::io::duplex` in tests).
pub struct StreamTransport {
    inbound: Mutex<mpsc::Receiver<Result<Value>>>,
    outbound: mpsc::Sender<OutboundFrame>,
    shutdown: CancellationToken,
}

impl StreamTransport {
    /// Spawn reader and writer tasks over the given streams.
    ///
    /// The reader starts consuming immediately, so bytes that arrive before
    /// the first `recv` call are buffered rather than lost.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shutdown = CancellationToken::new();

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let read_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = tokio::select! {
                    _ = read_shutdown.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let parsed = serde_json::from_str::<Value>(&line).map_err(|e| {
                            AgentError::Transport(format!("Malformed frame: {}", e))
                        });
                        if inbound_tx.send(parsed).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = inbound_tx
                            .send(Err(AgentError::Transport(format!("Read failed: {}", e))))
                            .await;
                        break;
                    }
                }
            }
            tracing::debug!("Stream transport reader finished");
        });

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_BUFFER);
        let write_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut writer = writer;
            loop {
                let frame = tokio::select! {
                    _ = write_shutdown.cancelled() => break,
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let result = async {
                    writer.write_all(frame.line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await?;
                    Ok::<_, std::io::Error>(())
                }
                .await
                .map_err(|e| AgentError::Transport(format!("Write failed: {}", e)));

                let failed = result.is_err();
                let _ = frame.done.send(result);
                if failed {
                    break;
                }
            }
            tracing::debug!("Stream transport writer finished");
        });

        Self {
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
            shutdown,
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn recv(&self) -> Option<Result<Value>> {
        self.inbound.lock().await.recv().await
    }

    async fn send(&self, message: Value) -> Result<()> {
        let line = serde_json::to_string(&message)?;
        debug_assert!(
            !line.contains('\n') && !line.contains('\r'),
            "serialized frame must be a single line"
        );

        let (done_tx, done_rx) = oneshot::channel();
        self.outbound
            .send(OutboundFrame {
                line,
                done: done_tx,
            })
            .await
            .map_err(|_| AgentError::Transport("Transport closed".to_string()))?;

        done_rx
            .await
            .map_err(|_| AgentError::Transport("Transport closed".to_string()))?
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Single-shot request/response transport.
///
/// The full request body is parsed into exactly one inbound message; the
/// first outbound message closes the response. A second write is a
/// contract violation and fails loudly.
pub struct HttpTransport {
    inbound: std::sync::Mutex<Option<Value>>,
    response: std::sync::Mutex<Option<oneshot::Sender<Value>>>,
}

impl HttpTransport {
    /// Parse the request body and return the transport plus the receiver
    /// the response body is drawn from. A dropped sender (no outbound
    /// message) signals "no content".
    pub fn new(body: &[u8]) -> Result<(Self, oneshot::Receiver<Value>)> {
        let message: Value = serde_json::from_slice(body)
            .map_err(|e| AgentError::Transport(format!("Malformed request body: {}", e)))?;
        if !message.is_object() {
            return Err(AgentError::Transport(
                "Request body must be a JSON object".to_string(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        Ok((
            Self {
                inbound: std::sync::Mutex::new(Some(message)),
                response: std::sync::Mutex::new(Some(tx)),
            },
            rx,
        ))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn recv(&self) -> Option<Result<Value>> {
        self.inbound
            .lock()
            .expect("inbound lock poisoned")
            .take()
            .map(Ok)
    }

    async fn send(&self, message: Value) -> Result<()> {
        let sender = self
            .response
            .lock()
            .expect("response lock poisoned")
            .take()
            .ok_or_else(|| {
                AgentError::Transport("HTTP stream does not support multiple writes".to_string())
            })?;

        // The response future may already be gone (client hung up); the
        // write itself still counts as delivered.
        let _ = sender.send(message);
        Ok(())
    }

    fn close(&self) {
        self.response.lock().expect("response lock poisoned").take();
    }
}
