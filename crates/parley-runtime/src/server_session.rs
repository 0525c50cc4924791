//! Server-side session: one per accepted client connection.
//!
//! Mirrors the client session's multiplexing, plus the initialization state
//! machine and the per-session exchange handed to feature handlers once the
//! client reports readiness.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parley_schema::jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use parley_schema::types::{
    ClientCapabilities, CreateMessageRequest, CreateMessageResult, Implementation,
    InitializeRequest, InitializeResult, ListRootsResult, LoggingLevel,
    LoggingMessageNotification, PaginatedRequest, ResourceUpdatedNotification,
};
use parley_schema::{error_codes, methods};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::client_session::exchange_request;
use crate::error::McpError;
use crate::pending::RequestTracker;
use crate::transport::{Transport, CHANNEL_CAPACITY};

/// Handles one feature request. The exchange lets the handler call back into
/// the connected client.
pub type ServerRequestHandler = Arc<
    dyn Fn(ServerExchange, Option<Value>) -> BoxFuture<'static, Result<Value, McpError>>
        + Send
        + Sync,
>;

pub type ServerNotificationHandler = Arc<
    dyn Fn(ServerExchange, Option<Value>) -> BoxFuture<'static, Result<(), McpError>>
        + Send
        + Sync,
>;

/// Invoked on the inbound `initialize` request; returns the negotiated
/// version, server capabilities, server info and instructions.
pub type InitRequestHandler = Arc<
    dyn Fn(InitializeRequest) -> BoxFuture<'static, Result<InitializeResult, McpError>>
        + Send
        + Sync,
>;

/// Creates a 1:1 server session for each transport a provider accepts.
pub type SessionFactory = Arc<dyn Fn(Arc<dyn Transport>) -> Arc<ServerSession> + Send + Sync>;

const STATE_UNINITIALIZED: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_INITIALIZED: u8 = 2;

pub struct ServerSession {
    id: String,
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    tracker: RequestTracker,
    init_handler: InitRequestHandler,
    request_handlers: HashMap<String, ServerRequestHandler>,
    notification_handlers: HashMap<String, ServerNotificationHandler>,
    state: AtomicU8,
    client: OnceLock<(ClientCapabilities, Implementation)>,
    exchange: OnceLock<ServerExchange>,
    closed: AtomicBool,
    weak_self: Weak<ServerSession>,
    notif_tx: mpsc::Sender<JsonRpcNotification>,
    notifier: Mutex<Option<JoinHandle<()>>>,
}

impl ServerSession {
    pub fn create(
        id: impl Into<String>,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
        init_handler: InitRequestHandler,
        request_handlers: HashMap<String, ServerRequestHandler>,
        notification_handlers: HashMap<String, ServerNotificationHandler>,
    ) -> Arc<Self> {
        let id = id.into();
        let (notif_tx, notif_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let session = Arc::new_cyclic(|weak: &Weak<ServerSession>| Self {
            tracker: RequestTracker::new(id.clone()),
            id,
            transport,
            request_timeout,
            init_handler,
            request_handlers,
            notification_handlers,
            state: AtomicU8::new(STATE_UNINITIALIZED),
            client: OnceLock::new(),
            exchange: OnceLock::new(),
            closed: AtomicBool::new(false),
            weak_self: weak.clone(),
            notif_tx,
            notifier: Mutex::new(None),
        });

        let worker = tokio::spawn(notification_worker(
            Arc::downgrade(&session),
            notif_rx,
        ));
        *session.notifier.lock().expect("notifier handle") = Some(worker);
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_INITIALIZED
    }

    /// Provider entry point: route one inbound envelope. Responses complete
    /// their waiter inline; request and notification handlers are dispatched
    /// without blocking the caller.
    pub async fn handle(&self, message: JsonRpcMessage) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::SessionClosed);
        }
        match message {
            JsonRpcMessage::Response(response) => {
                debug!(session = %self.id, id = %response.id, "received response");
                self.tracker.complete(response);
                Ok(())
            }
            JsonRpcMessage::Request(request) => self.handle_request(request).await,
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification).await
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> Result<(), McpError> {
        debug!(session = %self.id, method = %request.method, id = %request.id, "received request");

        if request.method == methods::INITIALIZE {
            return self.handle_initialize(request).await;
        }

        // Ping is answered in any lifecycle state.
        if request.method == methods::PING {
            return self
                .send_response(JsonRpcResponse::ok(request.id, json!({})))
                .await;
        }

        let Some(exchange) = self.exchange.get().cloned() else {
            return self
                .send_response(JsonRpcResponse::err(
                    request.id,
                    JsonRpcError::new(
                        error_codes::SERVER_NOT_INITIALIZED,
                        "session not initialized",
                    ),
                ))
                .await;
        };

        let Some(handler) = self.request_handlers.get(&request.method).cloned() else {
            return self
                .send_response(JsonRpcResponse::err(
                    request.id,
                    JsonRpcError::new(
                        error_codes::METHOD_NOT_FOUND,
                        format!("Method not found: {}", request.method),
                    ),
                ))
                .await;
        };

        // Handlers may be long-running and must not stall the inbound path:
        // each runs on its own task and pipes its response back through the
        // session transport.
        let session = self.weak_self.clone();
        tokio::spawn(async move {
            let response = match handler(exchange, request.params).await {
                Ok(result) => JsonRpcResponse::ok(request.id, result),
                Err(e) => JsonRpcResponse::err(request.id, e.to_json_rpc()),
            };
            if let Some(session) = session.upgrade() {
                let _ = session.send_response(response).await;
            }
        });
        Ok(())
    }

    async fn handle_initialize(&self, request: JsonRpcRequest) -> Result<(), McpError> {
        let init: InitializeRequest = match parley_schema::from_value(request.params) {
            Ok(init) => init,
            Err(e) => {
                return self
                    .send_response(JsonRpcResponse::err(
                        request.id,
                        JsonRpcError::new(
                            error_codes::INVALID_PARAMS,
                            format!("invalid initialize params: {e}"),
                        ),
                    ))
                    .await;
            }
        };

        if self
            .state
            .compare_exchange(
                STATE_UNINITIALIZED,
                STATE_INITIALIZING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return self
                .send_response(JsonRpcResponse::err(
                    request.id,
                    JsonRpcError::new(
                        error_codes::INVALID_REQUEST,
                        "initialize already received",
                    ),
                ))
                .await;
        }

        let _ = self
            .client
            .set((init.capabilities.clone(), init.client_info.clone()));

        let response = match (self.init_handler)(init).await {
            Ok(result) => match serde_json::to_value(&result) {
                Ok(value) => JsonRpcResponse::ok(request.id, value),
                Err(e) => JsonRpcResponse::err(
                    request.id,
                    JsonRpcError::new(error_codes::INTERNAL_ERROR, e.to_string()),
                ),
            },
            Err(e) => JsonRpcResponse::err(request.id, e.to_json_rpc()),
        };
        self.send_response(response).await
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        debug!(session = %self.id, method = %notification.method, "received notification");

        if notification.method == methods::NOTIFICATION_INITIALIZED {
            let Some((capabilities, info)) = self.client.get().cloned() else {
                warn!(session = %self.id, "initialized notification before initialize request");
                return Ok(());
            };
            self.state.store(STATE_INITIALIZED, Ordering::SeqCst);
            let _ = self.exchange.set(ServerExchange::new(
                self.weak_self.clone(),
                capabilities,
                info,
            ));
            return Ok(());
        }

        if self.exchange.get().is_none() {
            error!(
                session = %self.id,
                method = %notification.method,
                "dropping notification received before initialization completed"
            );
            return Ok(());
        }

        // Serialized worker keeps peers' notification order observable.
        if self.notif_tx.send(notification).await.is_err() {
            return Err(McpError::SessionClosed);
        }
        Ok(())
    }

    pub async fn send_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::SessionClosed);
        }
        exchange_request(
            self.transport.as_ref(),
            &self.tracker,
            self.request_timeout,
            method,
            params,
        )
        .await
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::SessionClosed);
        }
        self.transport
            .send(JsonRpcNotification::new(method, params).into())
            .await
            .map_err(Into::into)
    }

    async fn send_response(&self, response: JsonRpcResponse) -> Result<(), McpError> {
        self.transport
            .send(response.into())
            .await
            .map_err(|e| {
                warn!(session = %self.id, error = %e, "failed to send response");
                e.into()
            })
    }

    pub async fn close_gracefully(&self) {
        self.shutdown();
        self.transport.close_gracefully().await;
    }

    pub fn close(&self) {
        self.shutdown();
        self.transport.close();
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.notifier.lock().expect("notifier handle").take() {
            task.abort();
        }
        self.tracker.fail_all();
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn notification_worker(
    session: Weak<ServerSession>,
    mut receiver: mpsc::Receiver<JsonRpcNotification>,
) {
    while let Some(notification) = receiver.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        let Some(exchange) = session.exchange.get().cloned() else {
            continue;
        };
        match session.notification_handlers.get(&notification.method) {
            None => {
                error!(method = %notification.method, "no handler registered for notification");
            }
            Some(handler) => {
                if let Err(e) = handler(exchange, notification.params).await {
                    error!(method = %notification.method, error = %e, "error handling notification");
                }
            }
        }
    }
}

/// Per-session handle carried by every feature handler; supports reverse
/// calls into the connected client and holds the session-scoped logging and
/// subscription state.
#[derive(Clone)]
pub struct ServerExchange {
    session: Weak<ServerSession>,
    client_capabilities: ClientCapabilities,
    client_info: Implementation,
    min_logging_level: Arc<Mutex<LoggingLevel>>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
}

impl ServerExchange {
    fn new(
        session: Weak<ServerSession>,
        client_capabilities: ClientCapabilities,
        client_info: Implementation,
    ) -> Self {
        Self {
            session,
            client_capabilities,
            client_info,
            min_logging_level: Arc::new(Mutex::new(LoggingLevel::Info)),
            subscriptions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn session(&self) -> Result<Arc<ServerSession>, McpError> {
        self.session.upgrade().ok_or(McpError::SessionClosed)
    }

    pub fn client_capabilities(&self) -> &ClientCapabilities {
        &self.client_capabilities
    }

    pub fn client_info(&self) -> &Implementation {
        &self.client_info
    }

    pub fn session_id(&self) -> Result<String, McpError> {
        Ok(self.session()?.id().to_string())
    }

    /// Ask the connected client to run an LLM turn on the server's behalf.
    /// Fails locally when the client did not advertise sampling.
    pub async fn create_message(
        &self,
        request: CreateMessageRequest,
    ) -> Result<CreateMessageResult, McpError> {
        if self.client_capabilities.sampling.is_none() {
            return Err(McpError::CapabilityMissing(
                "Client must be configured with sampling capabilities".to_string(),
            ));
        }
        self.session()?
            .send_request(
                methods::SAMPLING_CREATE_MESSAGE,
                Some(serde_json::to_value(request)?),
            )
            .await
    }

    /// List the roots the client advertises. Fails locally when the client
    /// did not advertise the roots capability.
    pub async fn list_roots(&self, cursor: Option<String>) -> Result<ListRootsResult, McpError> {
        if self.client_capabilities.roots.is_none() {
            return Err(McpError::CapabilityMissing(
                "Client must be configured with roots capabilities".to_string(),
            ));
        }
        self.session()?
            .send_request(
                methods::ROOTS_LIST,
                Some(serde_json::to_value(PaginatedRequest::new(cursor))?),
            )
            .await
    }

    pub async fn ping(&self) -> Result<Value, McpError> {
        self.session()?.send_request(methods::PING, None).await
    }

    /// Send a log message to this client. Messages strictly below the
    /// session's minimum level are dropped before transmission.
    pub async fn logging_notification(
        &self,
        notification: LoggingMessageNotification,
    ) -> Result<(), McpError> {
        if notification.level < self.min_logging_level() {
            return Ok(());
        }
        self.session()?
            .send_notification(
                methods::NOTIFICATION_MESSAGE,
                Some(serde_json::to_value(notification)?),
            )
            .await
    }

    pub fn min_logging_level(&self) -> LoggingLevel {
        *self.min_logging_level.lock().expect("logging level")
    }

    pub fn set_min_logging_level(&self, level: LoggingLevel) {
        *self.min_logging_level.lock().expect("logging level") = level;
    }

    pub fn subscribe(&self, uri: impl Into<String>) {
        self.subscriptions
            .lock()
            .expect("subscriptions")
            .insert(uri.into());
    }

    pub fn unsubscribe(&self, uri: &str) {
        self.subscriptions.lock().expect("subscriptions").remove(uri);
    }

    pub fn is_subscribed(&self, uri: &str) -> bool {
        self.subscriptions.lock().expect("subscriptions").contains(uri)
    }

    /// Notify the client that a subscribed resource changed; a no-op for
    /// uris this session never subscribed to.
    pub async fn resource_updated(&self, uri: &str) -> Result<(), McpError> {
        if !self.is_subscribed(uri) {
            return Ok(());
        }
        self.session()?
            .send_notification(
                methods::NOTIFICATION_RESOURCES_UPDATED,
                Some(serde_json::to_value(ResourceUpdatedNotification {
                    uri: uri.to_string(),
                })?),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pipe, PeerEnd};
    use parley_schema::jsonrpc::RequestId;
    use parley_schema::types::ServerCapabilities;

    fn init_handler() -> InitRequestHandler {
        Arc::new(|init: InitializeRequest| {
            Box::pin(async move {
                Ok(InitializeResult {
                    protocol_version: init.protocol_version,
                    capabilities: ServerCapabilities::default(),
                    server_info: Implementation::new("s", "1"),
                    instructions: None,
                })
            })
        })
    }

    async fn session_with_peer(
        request_handlers: HashMap<String, ServerRequestHandler>,
    ) -> (Arc<ServerSession>, PeerEnd) {
        let (near, far) = pipe();
        let session = ServerSession::create(
            "sess1",
            near,
            Duration::from_secs(5),
            init_handler(),
            request_handlers,
            HashMap::new(),
        );
        (session, PeerEnd::attach(far).await)
    }

    fn initialize_request(id: i64) -> JsonRpcRequest {
        JsonRpcRequest::new(
            RequestId::from(id),
            methods::INITIALIZE,
            Some(
                serde_json::to_value(InitializeRequest {
                    protocol_version: parley_schema::LATEST_PROTOCOL_VERSION.to_string(),
                    capabilities: ClientCapabilities::default(),
                    client_info: Implementation::new("x", "1"),
                })
                .expect("params"),
            ),
        )
    }

    fn echo_handler() -> ServerRequestHandler {
        Arc::new(|_, params| Box::pin(async move { Ok(params.unwrap_or(Value::Null)) }))
    }

    #[tokio::test]
    async fn requests_before_initialization_are_rejected() {
        let mut handlers = HashMap::new();
        handlers.insert("tools/list".to_string(), echo_handler());
        let (session, mut peer) = session_with_peer(handlers).await;

        session
            .handle(JsonRpcRequest::new(RequestId::from(1), "tools/list", None).into())
            .await
            .expect("handled");
        let JsonRpcMessage::Response(resp) = peer.recv().await else {
            panic!("expected response");
        };
        assert_eq!(
            resp.error.map(|e| e.code),
            Some(error_codes::SERVER_NOT_INITIALIZED)
        );
    }

    #[tokio::test]
    async fn ping_is_answered_in_any_state() {
        let (session, mut peer) = session_with_peer(HashMap::new()).await;
        session
            .handle(JsonRpcRequest::new(RequestId::from(1), methods::PING, None).into())
            .await
            .expect("handled");
        let JsonRpcMessage::Response(resp) = peer.recv().await else {
            panic!("expected response");
        };
        assert!(resp.error.is_none());
        assert_eq!(resp.result, Some(json!({})));
    }

    #[tokio::test]
    async fn full_lifecycle_unlocks_feature_handlers() {
        let mut handlers = HashMap::new();
        handlers.insert("tools/list".to_string(), echo_handler());
        let (session, mut peer) = session_with_peer(handlers).await;

        session
            .handle(initialize_request(1).into())
            .await
            .expect("initialize");
        let JsonRpcMessage::Response(resp) = peer.recv().await else {
            panic!("expected response");
        };
        assert!(resp.error.is_none(), "init failed: {:?}", resp.error);
        assert!(!session.is_initialized());

        // Still locked until the initialized notification arrives.
        session
            .handle(JsonRpcRequest::new(RequestId::from(2), "tools/list", None).into())
            .await
            .expect("handled");
        let JsonRpcMessage::Response(resp) = peer.recv().await else {
            panic!("expected response");
        };
        assert_eq!(
            resp.error.map(|e| e.code),
            Some(error_codes::SERVER_NOT_INITIALIZED)
        );

        session
            .handle(
                JsonRpcNotification::new(methods::NOTIFICATION_INITIALIZED, None).into(),
            )
            .await
            .expect("initialized");
        assert!(session.is_initialized());

        session
            .handle(
                JsonRpcRequest::new(RequestId::from(3), "tools/list", Some(json!({"a": 1})))
                    .into(),
            )
            .await
            .expect("handled");
        let JsonRpcMessage::Response(resp) = peer.recv().await else {
            panic!("expected response");
        };
        assert_eq!(resp.result, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() {
        let (session, mut peer) = session_with_peer(HashMap::new()).await;

        session
            .handle(initialize_request(1).into())
            .await
            .expect("initialize");
        peer.recv().await;

        session
            .handle(initialize_request(2).into())
            .await
            .expect("handled");
        let JsonRpcMessage::Response(resp) = peer.recv().await else {
            panic!("expected response");
        };
        let error = resp.error.expect("error");
        assert_eq!(error.code, error_codes::INVALID_REQUEST);
        assert_eq!(error.message, "initialize already received");
    }

    #[tokio::test]
    async fn unknown_method_after_initialization() {
        let (session, mut peer) = session_with_peer(HashMap::new()).await;
        session.handle(initialize_request(1).into()).await.expect("init");
        peer.recv().await;
        session
            .handle(
                JsonRpcNotification::new(methods::NOTIFICATION_INITIALIZED, None).into(),
            )
            .await
            .expect("initialized");

        session
            .handle(JsonRpcRequest::new(RequestId::from(2), "nope", None).into())
            .await
            .expect("handled");
        let JsonRpcMessage::Response(resp) = peer.recv().await else {
            panic!("expected response");
        };
        assert_eq!(
            resp.error.map(|e| e.code),
            Some(error_codes::METHOD_NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn exchange_reverse_call_reaches_the_peer() {
        let mut handlers = HashMap::new();
        // Handler pings the client through the exchange before answering.
        handlers.insert(
            "needs/roots".to_string(),
            Arc::new(
                |exchange: ServerExchange, _params: Option<Value>| -> BoxFuture<'static, Result<Value, McpError>> {
                    Box::pin(async move {
                        let roots = exchange.list_roots(None).await?;
                        Ok(json!({"count": roots.roots.len()}))
                    })
                },
            ) as ServerRequestHandler,
        );
        let (session, mut peer) = session_with_peer(handlers).await;

        let init = JsonRpcRequest::new(
            RequestId::from(1),
            methods::INITIALIZE,
            Some(
                serde_json::to_value(InitializeRequest {
                    protocol_version: parley_schema::LATEST_PROTOCOL_VERSION.to_string(),
                    capabilities: ClientCapabilities {
                        roots: Some(Default::default()),
                        ..Default::default()
                    },
                    client_info: Implementation::new("x", "1"),
                })
                .expect("params"),
            ),
        );
        session.handle(init.into()).await.expect("init");
        peer.recv().await;
        session
            .handle(
                JsonRpcNotification::new(methods::NOTIFICATION_INITIALIZED, None).into(),
            )
            .await
            .expect("initialized");

        session
            .handle(JsonRpcRequest::new(RequestId::from(2), "needs/roots", None).into())
            .await
            .expect("dispatch");

        // The reverse roots/list request shows up at the peer; answer it.
        let JsonRpcMessage::Request(req) = peer.recv().await else {
            panic!("expected reverse request");
        };
        assert_eq!(req.method, methods::ROOTS_LIST);
        let reverse_id = req.id.clone();
        session
            .handle(
                JsonRpcResponse::ok(reverse_id, json!({"roots": [{"uri": "file:///w"}]})).into(),
            )
            .await
            .expect("reverse response");

        let JsonRpcMessage::Response(resp) = peer.recv().await else {
            panic!("expected final response");
        };
        assert_eq!(resp.id, RequestId::from(2));
        assert_eq!(resp.result, Some(json!({"count": 1})));
    }

    #[tokio::test]
    async fn logging_below_minimum_level_is_dropped() {
        let (session, mut peer) = session_with_peer(HashMap::new()).await;
        session.handle(initialize_request(1).into()).await.expect("init");
        peer.recv().await;
        session
            .handle(
                JsonRpcNotification::new(methods::NOTIFICATION_INITIALIZED, None).into(),
            )
            .await
            .expect("initialized");

        let exchange = session.exchange.get().cloned().expect("exchange");
        exchange
            .logging_notification(LoggingMessageNotification {
                level: LoggingLevel::Debug,
                logger: None,
                data: json!("quiet"),
            })
            .await
            .expect("filtered send");
        assert!(peer
            .try_recv_timeout(Duration::from_millis(50))
            .await
            .is_none());

        exchange.set_min_logging_level(LoggingLevel::Debug);
        exchange
            .logging_notification(LoggingMessageNotification {
                level: LoggingLevel::Debug,
                logger: None,
                data: json!("loud"),
            })
            .await
            .expect("send");
        let JsonRpcMessage::Notification(n) = peer.recv().await else {
            panic!("expected notification");
        };
        assert_eq!(n.method, methods::NOTIFICATION_MESSAGE);
    }
}
