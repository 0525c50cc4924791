//! In-memory loopback transport for session tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parley_schema::JsonRpcMessage;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{ClientTransport, Transport, CHANNEL_CAPACITY};

pub(crate) struct PipeTransport {
    out_tx: mpsc::Sender<JsonRpcMessage>,
    in_rx: Mutex<Option<mpsc::Receiver<JsonRpcMessage>>>,
    closed: AtomicBool,
}

/// Cross-wired pair of in-memory transports.
pub(crate) fn pipe() -> (Arc<PipeTransport>, Arc<PipeTransport>) {
    pipe_with_capacity(CHANNEL_CAPACITY)
}

pub(crate) fn pipe_with_capacity(capacity: usize) -> (Arc<PipeTransport>, Arc<PipeTransport>) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    let a = Arc::new(PipeTransport {
        out_tx: a_tx,
        in_rx: Mutex::new(Some(b_rx)),
        closed: AtomicBool::new(false),
    });
    let b = Arc::new(PipeTransport {
        out_tx: b_tx,
        in_rx: Mutex::new(Some(a_rx)),
        closed: AtomicBool::new(false),
    });
    (a, b)
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.out_tx.try_send(message).map_err(|e| match e {
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

#[async_trait]
impl ClientTransport for PipeTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<JsonRpcMessage>, TransportError> {
        self.in_rx
            .lock()
            .expect("pipe receiver")
            .take()
            .ok_or(TransportError::AlreadyConnected)
    }
}

/// A scripted peer on the far end of a pipe.
pub(crate) struct PeerEnd {
    transport: Arc<PipeTransport>,
    rx: mpsc::Receiver<JsonRpcMessage>,
}

impl PeerEnd {
    pub(crate) async fn attach(transport: Arc<PipeTransport>) -> Self {
        let rx = transport.connect().await.expect("peer connect");
        Self { transport, rx }
    }

    pub(crate) async fn send(&self, message: JsonRpcMessage) {
        self.transport.send(message).await.expect("peer send");
    }

    pub(crate) async fn recv(&mut self) -> JsonRpcMessage {
        self.rx.recv().await.expect("peer recv")
    }

    pub(crate) async fn try_recv_timeout(
        &mut self,
        wait: std::time::Duration,
    ) -> Option<JsonRpcMessage> {
        tokio::time::timeout(wait, self.rx.recv()).await.ok().flatten()
    }
}
