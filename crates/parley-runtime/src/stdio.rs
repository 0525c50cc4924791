//! Stdio transport: owns a server child process and speaks line-delimited
//! JSON over its stdin/stdout. Stderr is surfaced out-of-band to an optional
//! consumer and never parsed as protocol.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_schema::{codec, JsonRpcMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{ClientTransport, Transport, CHANNEL_CAPACITY};

/// Command, arguments and environment used to launch the server process.
#[derive(Debug, Clone)]
pub struct ServerParameters {
    pub command: String,
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
}

impl ServerParameters {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            envs: HashMap::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }
}

type StderrConsumer = Arc<dyn Fn(String) + Send + Sync>;

/// Client-side stdio transport.
///
/// `connect` spawns the child and three worker tasks: a stdout line reader
/// feeding the inbound channel, a stdin writer draining the bounded outbound
/// queue, and a stderr reader feeding the diagnostic consumer.
pub struct StdioClientTransport {
    params: ServerParameters,
    stderr_consumer: StderrConsumer,
    outbound: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connected: AtomicBool,
    closing: Arc<AtomicBool>,
}

impl StdioClientTransport {
    pub fn new(params: ServerParameters) -> Self {
        Self {
            params,
            stderr_consumer: Arc::new(|line| info!(target: "parley::stdio", "server stderr: {line}")),
            outbound: Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the default stderr consumer (which logs each line).
    pub fn with_stderr_consumer(mut self, consumer: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.stderr_consumer = Arc::new(consumer);
        self
    }

    /// Wait for the child process to exit; returns its status code if any.
    pub async fn await_exit(&self) -> Option<i32> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => child.wait().await.ok().and_then(|s| s.code()),
            None => None,
        }
    }
}

#[async_trait]
impl Transport for StdioClientTransport {
    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let sender = {
            let guard = self.outbound.lock().expect("outbound sender");
            guard.clone().ok_or(TransportError::Closed)?
        };
        sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    async fn close_gracefully(&self) {
        self.closing.store(true, Ordering::SeqCst);

        // Dropping the sender lets the writer drain what is already queued.
        self.outbound.lock().expect("outbound sender").take();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            debug!("terminating server process");
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to signal server process");
            }
            match child.wait().await {
                Ok(status) if !status.success() => {
                    warn!(code = ?status.code(), "server process terminated with non-zero status");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to await server process exit"),
            }
        }
        drop(guard);

        for task in self.tasks.lock().expect("worker tasks").drain(..) {
            task.abort();
        }
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.outbound.lock().expect("outbound sender").take();
        for task in self.tasks.lock().expect("worker tasks").drain(..) {
            task.abort();
        }
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.start_kill();
                // Reap the child off-task so close() stays synchronous.
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
        }
    }
}

#[async_trait]
impl ClientTransport for StdioClientTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<JsonRpcMessage>, TransportError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }

        let mut child = Command::new(&self.params.command)
            .args(&self.params.args)
            .envs(&self.params.envs)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                TransportError::Spawn(format!("{} {:?}: {e}", self.params.command, self.params.args))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Spawn("server process has no stdin pipe".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Spawn("server process has no stdout pipe".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::Spawn("server process has no stderr pipe".to_string())
        })?;

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);

        let closing = self.closing.clone();
        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(message) = outbound_rx.recv().await {
                let line = match codec::encode_line(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable outbound message");
                        continue;
                    }
                };
                let write = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                };
                if let Err(e) = write.await {
                    if !closing.load(Ordering::SeqCst) {
                        warn!(error = %e, "error writing to server stdin");
                    }
                    break;
                }
            }
        });

        let closing = self.closing.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match codec::decode_line(&line) {
                            Ok(message) => {
                                if inbound_tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            // Malformed inbound bytes never kill the session.
                            Err(e) => warn!(error = %e, "dropping undecodable line from server"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if !closing.load(Ordering::SeqCst) {
                            warn!(error = %e, "error reading from server stdout");
                        }
                        break;
                    }
                }
            }
        });

        let consumer = self.stderr_consumer.clone();
        let errors = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                consumer(line);
            }
        });

        *self.outbound.lock().expect("outbound sender") = Some(outbound_tx);
        *self.child.lock().await = Some(child);
        self.tasks
            .lock()
            .expect("worker tasks")
            .extend([writer, reader, errors]);

        Ok(inbound_rx)
    }
}
