//! Stdio session provider: exactly one session, speaking line-delimited
//! JSON over this process's stdin/stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use parley_runtime::{
    McpError, ServerSession, SessionFactory, Transport, TransportError, CHANNEL_CAPACITY,
};
use parley_schema::jsonrpc::{JsonRpcError, JsonRpcMessage, JsonRpcResponse, RequestId};
use parley_schema::{codec, error_codes};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ServerTransportProvider;

pub struct StdioServerProvider {
    factory: OnceLock<SessionFactory>,
    session: Mutex<Option<Arc<ServerSession>>>,
    closing: AtomicBool,
}

impl Default for StdioServerProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioServerProvider {
    pub fn new() -> Self {
        Self {
            factory: OnceLock::new(),
            session: Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }

    /// Serve the session over this process's stdin/stdout until EOF.
    pub async fn run(&self) -> Result<(), McpError> {
        self.run_with(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve the session over arbitrary byte streams. Parse failures are
    /// answered with error responses and never kill the loop; EOF closes the
    /// session gracefully.
    pub async fn run_with<R, W>(&self, reader: R, writer: W) -> Result<(), McpError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let factory = self
            .factory
            .get()
            .ok_or_else(|| McpError::Internal("session factory not set".to_string()))?;

        let (tx, mut rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);
        let transport = Arc::new(StdioSessionTransport {
            tx: tx.clone(),
            closed: AtomicBool::new(false),
        });
        let session = factory(transport.clone());
        *self.session.lock().expect("session slot") = Some(session.clone());

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(message) = rx.recv().await {
                let line = match codec::encode_line(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable outbound message");
                        continue;
                    }
                };
                let write = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                };
                if let Err(e) = write.await {
                    warn!(error = %e, "error writing to stdout");
                    break;
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        loop {
            if self.closing.load(Ordering::SeqCst) {
                break;
            }
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match codec::decode_line(&line) {
                        Ok(message) => {
                            if let Err(e) = session.handle(message).await {
                                warn!(error = %e, "failed to handle inbound message");
                            }
                        }
                        Err(codec::DecodeError::Parse(e)) => {
                            let response = JsonRpcResponse::err(
                                RequestId::Null,
                                JsonRpcError::new(
                                    error_codes::PARSE_ERROR,
                                    format!("parse error: {e}"),
                                ),
                            );
                            let _ = tx.send(response.into()).await;
                        }
                        Err(codec::DecodeError::Invalid(e)) => {
                            let response = JsonRpcResponse::err(
                                RequestId::Null,
                                JsonRpcError::new(error_codes::INVALID_REQUEST, e.to_string()),
                            );
                            let _ = tx.send(response.into()).await;
                        }
                    }
                }
                Ok(None) => {
                    debug!("stdin closed, shutting down stdio session");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "error reading from stdin");
                    break;
                }
            }
        }

        session.close_gracefully().await;
        self.session.lock().expect("session slot").take();
        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }
}

#[async_trait]
impl ServerTransportProvider for StdioServerProvider {
    fn set_session_factory(&self, factory: SessionFactory) {
        if self.factory.set(factory).is_err() {
            warn!("session factory already set, ignoring replacement");
        }
    }

    async fn notify_clients(&self, method: &str, params: Option<Value>) {
        let session = self.session.lock().expect("session slot").clone();
        if let Some(session) = session {
            if let Err(e) = session.send_notification(method, params).await {
                tracing::error!(error = %e, "failed to notify stdio session");
            }
        }
    }

    async fn close_gracefully(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let session = self.session.lock().expect("session slot").take();
        if let Some(session) = session {
            session.close_gracefully().await;
        }
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(session) = self.session.lock().expect("session slot").take() {
            session.close();
        }
    }
}

struct StdioSessionTransport {
    tx: mpsc::Sender<JsonRpcMessage>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for StdioSessionTransport {
    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    async fn close_gracefully(&self) {
        self.close();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
