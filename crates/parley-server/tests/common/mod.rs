//! Shared fixtures: a channel-backed server transport and a provider that
//! records broadcasts instead of shipping them anywhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use parley_runtime::{ServerSession, SessionFactory, Transport, TransportError};
use parley_schema::jsonrpc::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use parley_schema::types::{ClientCapabilities, Implementation, InitializeRequest};
use parley_schema::methods;
use parley_server::ServerTransportProvider;
use serde_json::Value;
use tokio::sync::mpsc;

pub struct ChannelTransport {
    tx: mpsc::Sender<JsonRpcMessage>,
    closed: AtomicBool,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<JsonRpcMessage>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
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

#[derive(Default)]
pub struct RecordingProvider {
    factory: OnceLock<SessionFactory>,
    pub broadcasts: Mutex<Vec<(String, Option<Value>)>>,
}

impl RecordingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spin up a session the way a real provider would on accept.
    pub fn open_session(&self) -> (Arc<ServerSession>, mpsc::Receiver<JsonRpcMessage>) {
        let factory = self.factory.get().expect("factory wired");
        let (transport, rx) = ChannelTransport::new();
        (factory(transport), rx)
    }

    pub fn broadcast_methods(&self) -> Vec<String> {
        self.broadcasts
            .lock()
            .expect("broadcasts")
            .iter()
            .map(|(method, _)| method.clone())
            .collect()
    }
}

#[async_trait]
impl ServerTransportProvider for RecordingProvider {
    fn set_session_factory(&self, factory: SessionFactory) {
        let _ = self.factory.set(factory);
    }

    async fn notify_clients(&self, method: &str, params: Option<Value>) {
        self.broadcasts
            .lock()
            .expect("broadcasts")
            .push((method.to_string(), params));
    }

    async fn close_gracefully(&self) {}

    fn close(&self) {}
}

pub fn initialize_request(id: i64, capabilities: ClientCapabilities) -> JsonRpcMessage {
    JsonRpcRequest::new(
        RequestId::from(id),
        methods::INITIALIZE,
        Some(
            serde_json::to_value(InitializeRequest {
                protocol_version: parley_schema::LATEST_PROTOCOL_VERSION.to_string(),
                capabilities,
                client_info: Implementation::new("test-client", "0.0.0"),
            })
            .expect("params"),
        ),
    )
    .into()
}

/// Run the full handshake against a session and return the initialize
/// response for inspection.
pub async fn handshake(
    session: &Arc<ServerSession>,
    rx: &mut mpsc::Receiver<JsonRpcMessage>,
) -> JsonRpcResponse {
    handshake_with(session, rx, ClientCapabilities::default()).await
}

pub async fn handshake_with(
    session: &Arc<ServerSession>,
    rx: &mut mpsc::Receiver<JsonRpcMessage>,
    capabilities: ClientCapabilities,
) -> JsonRpcResponse {
    session
        .handle(initialize_request(1, capabilities))
        .await
        .expect("initialize");
    let JsonRpcMessage::Response(response) = rx.recv().await.expect("response") else {
        panic!("expected initialize response");
    };
    assert!(response.error.is_none(), "init failed: {:?}", response.error);
    session
        .handle(JsonRpcNotification::new(methods::NOTIFICATION_INITIALIZED, None).into())
        .await
        .expect("initialized");
    response
}

/// Issue a request and wait for its matching response.
pub async fn roundtrip(
    session: &Arc<ServerSession>,
    rx: &mut mpsc::Receiver<JsonRpcMessage>,
    id: i64,
    method: &str,
    params: Option<Value>,
) -> JsonRpcResponse {
    session
        .handle(JsonRpcRequest::new(RequestId::from(id), method, params).into())
        .await
        .expect("dispatch");
    loop {
        let JsonRpcMessage::Response(response) = rx.recv().await.expect("message") else {
            continue;
        };
        if response.id == RequestId::from(id) {
            return response;
        }
    }
}
