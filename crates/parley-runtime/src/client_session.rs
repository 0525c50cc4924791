//! Client-side session: multiplexes concurrent request/response pairs and
//! notifications over a single bidirectional transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use parley_schema::jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use parley_schema::{error_codes, methods};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::McpError;
use crate::pending::RequestTracker;
use crate::transport::{ClientTransport, Transport, CHANNEL_CAPACITY};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Handles one inbound request; the returned value becomes the response
/// `result`. Failures travel back as internal-error responses.
pub type RequestHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, McpError>> + Send + Sync>;

/// Handles one inbound notification. Notifications never elicit a response;
/// failures are logged and dropped.
pub type NotificationHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<(), McpError>> + Send + Sync>;

/// One bidirectional JSON-RPC conversation from the client side.
///
/// Owns its transport and its pending-response map exclusively. Inbound
/// envelopes are observed in arrival order; request handlers run on their own
/// tasks so they can never stall the reader, while notifications drain
/// through a serialized worker so peers observe them in send order.
pub struct ClientSession {
    inner: Arc<SessionInner>,
    inbound: Mutex<Option<JoinHandle<()>>>,
    notifier: Mutex<Option<JoinHandle<()>>>,
}

struct SessionInner {
    transport: Arc<dyn ClientTransport>,
    request_timeout: Duration,
    tracker: RequestTracker,
    request_handlers: HashMap<String, RequestHandler>,
    notification_handlers: HashMap<String, NotificationHandler>,
    closed: AtomicBool,
}

impl ClientSession {
    /// Connect the transport and start dispatching.
    pub async fn connect(
        transport: Arc<dyn ClientTransport>,
        request_timeout: Duration,
        request_handlers: HashMap<String, RequestHandler>,
        notification_handlers: HashMap<String, NotificationHandler>,
    ) -> Result<Self, McpError> {
        let receiver = transport.connect().await?;

        let prefix = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let inner = Arc::new(SessionInner {
            transport,
            request_timeout,
            tracker: RequestTracker::new(prefix),
            request_handlers,
            notification_handlers,
            closed: AtomicBool::new(false),
        });

        let (notif_tx, notif_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let notifier = tokio::spawn(notification_worker(inner.clone(), notif_rx));
        let inbound = tokio::spawn(dispatch_loop(inner.clone(), receiver, notif_tx));

        Ok(Self {
            inner,
            inbound: Mutex::new(Some(inbound)),
            notifier: Mutex::new(Some(notifier)),
        })
    }

    /// Send a request and await its typed response, bounded by the session's
    /// request timeout. Exactly one outcome per issued id: a matched
    /// response, a timeout, or a transport failure.
    pub async fn send_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, McpError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(McpError::SessionClosed);
        }
        exchange_request(
            self.inner.transport.as_ref(),
            &self.inner.tracker,
            self.inner.request_timeout,
            method,
            params,
        )
        .await
    }

    /// Fire-and-forget: success means the envelope is buffered to the
    /// transport.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), McpError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(McpError::SessionClosed);
        }
        self.inner
            .transport
            .send(JsonRpcNotification::new(method, params).into())
            .await
            .map_err(Into::into)
    }

    /// Dispose the inbound subscription, then let the transport drain.
    /// Pending waiters fail with [`McpError::SessionClosed`].
    pub async fn close_gracefully(&self) {
        self.shutdown_dispatch();
        self.inner.transport.close_gracefully().await;
    }

    /// Immediate close; idempotent.
    pub fn close(&self) {
        self.shutdown_dispatch();
        self.inner.transport.close();
    }

    fn shutdown_dispatch(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inbound.lock().expect("inbound handle").take() {
            task.abort();
        }
        if let Some(task) = self.notifier.lock().expect("notifier handle").take() {
            task.abort();
        }
        self.inner.tracker.fail_all();
    }

    #[cfg(test)]
    pub(crate) fn pending_requests(&self) -> usize {
        self.inner.tracker.pending()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shutdown_dispatch();
    }
}

/// Shared request/response exchange used by both session sides: register the
/// waiter, write the envelope, await the waiter under the request timeout.
pub(crate) async fn exchange_request<T, Tr>(
    transport: &Tr,
    tracker: &RequestTracker,
    request_timeout: Duration,
    method: &str,
    params: Option<Value>,
) -> Result<T, McpError>
where
    T: DeserializeOwned,
    Tr: Transport + ?Sized,
{
    let (id, waiter) = tracker.register();
    let request = JsonRpcRequest::new(id.clone(), method, params);

    if let Err(e) = transport.send(request.into()).await {
        tracker.remove(&id);
        return Err(e.into());
    }

    match tokio::time::timeout(request_timeout, waiter).await {
        Err(_) => {
            tracker.remove(&id);
            Err(McpError::Timeout {
                method: method.to_string(),
            })
        }
        Ok(Err(_)) => Err(McpError::SessionClosed),
        Ok(Ok(response)) => {
            if let Some(error) = response.error {
                debug!(code = error.code, method, "request failed on the peer");
                return Err(McpError::from_json_rpc(error));
            }
            Ok(parley_schema::from_value(response.result)?)
        }
    }
}

async fn dispatch_loop(
    inner: Arc<SessionInner>,
    mut receiver: mpsc::Receiver<JsonRpcMessage>,
    notif_tx: mpsc::Sender<JsonRpcNotification>,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            JsonRpcMessage::Response(response) => {
                debug!(id = %response.id, "received response");
                inner.tracker.complete(response);
            }
            JsonRpcMessage::Request(request) => {
                debug!(method = %request.method, id = %request.id, "received request");
                let inner = inner.clone();
                tokio::spawn(async move { handle_request(inner, request).await });
            }
            JsonRpcMessage::Notification(notification) => {
                debug!(method = %notification.method, "received notification");
                if notif_tx.send(notification).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn notification_worker(
    inner: Arc<SessionInner>,
    mut receiver: mpsc::Receiver<JsonRpcNotification>,
) {
    while let Some(notification) = receiver.recv().await {
        match inner.notification_handlers.get(&notification.method) {
            None => {
                error!(method = %notification.method, "no handler registered for notification");
            }
            Some(handler) => {
                if let Err(e) = handler(notification.params).await {
                    error!(method = %notification.method, error = %e, "error handling notification");
                }
            }
        }
    }
}

async fn handle_request(inner: Arc<SessionInner>, request: JsonRpcRequest) {
    let response = match inner.request_handlers.get(&request.method) {
        None => JsonRpcResponse::err(request.id, method_not_found(&request.method)),
        Some(handler) => match handler(request.params).await {
            Ok(result) => JsonRpcResponse::ok(request.id, result),
            Err(e) => JsonRpcResponse::err(
                request.id,
                JsonRpcError::new(error_codes::INTERNAL_ERROR, e.to_string()),
            ),
        },
    };

    if let Err(e) = inner.transport.send(response.into()).await {
        warn!(error = %e, "failed to send response");
    }
}

/// MethodNotFound with a hint for known-but-unsupported methods.
fn method_not_found(method: &str) -> JsonRpcError {
    match method {
        methods::ROOTS_LIST => JsonRpcError::with_data(
            error_codes::METHOD_NOT_FOUND,
            "Roots not supported",
            json!({"reason": "Client does not have roots capability"}),
        ),
        _ => JsonRpcError::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::pipe;
    use parley_schema::jsonrpc::RequestId;

    async fn session_with_peer(
        request_timeout: Duration,
        request_handlers: HashMap<String, RequestHandler>,
        notification_handlers: HashMap<String, NotificationHandler>,
    ) -> (ClientSession, crate::test_support::PeerEnd) {
        let (near, far) = pipe();
        let session = ClientSession::connect(
            near,
            request_timeout,
            request_handlers,
            notification_handlers,
        )
        .await
        .expect("connect");
        let peer = crate::test_support::PeerEnd::attach(far).await;
        (session, peer)
    }

    #[tokio::test]
    async fn request_response_pairing() {
        let (session, mut peer) =
            session_with_peer(Duration::from_secs(5), HashMap::new(), HashMap::new()).await;

        let peer_task = tokio::spawn(async move {
            let JsonRpcMessage::Request(req) = peer.recv().await else {
                panic!("expected request");
            };
            assert_eq!(req.method, "ping");
            peer.send(JsonRpcResponse::ok(req.id, json!({"ok": true})).into())
                .await;
        });

        let result: Value = session.send_request("ping", None).await.expect("response");
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(session.pending_requests(), 0);
        peer_task.await.expect("peer");
    }

    #[tokio::test]
    async fn error_response_is_reconstructed() {
        let (session, mut peer) =
            session_with_peer(Duration::from_secs(5), HashMap::new(), HashMap::new()).await;

        tokio::spawn(async move {
            let JsonRpcMessage::Request(req) = peer.recv().await else {
                panic!("expected request");
            };
            peer.send(
                JsonRpcResponse::err(
                    req.id,
                    JsonRpcError::with_data(-32601, "method not found", json!({"hint": "nope"})),
                )
                .into(),
            )
            .await;
        });

        let err = session
            .send_request::<Value>("tools/unknown", None)
            .await
            .expect_err("error response");
        match err {
            McpError::Response { code, data, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(data, Some(json!({"hint": "nope"})));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_waiter_and_late_response_is_dropped() {
        let (session, mut peer) =
            session_with_peer(Duration::from_millis(50), HashMap::new(), HashMap::new()).await;

        let err = session
            .send_request::<Value>("slow/op", None)
            .await
            .expect_err("timeout");
        assert!(matches!(err, McpError::Timeout { .. }));
        assert_eq!(session.pending_requests(), 0);

        // The peer answers after the caller gave up: the response must be
        // dropped, not routed anywhere else.
        let JsonRpcMessage::Request(req) = peer.recv().await else {
            panic!("expected request");
        };
        peer.send(JsonRpcResponse::ok(req.id, json!({"late": true})).into())
            .await;

        // A fresh request still works and gets a fresh id.
        let peer_task = tokio::spawn(async move {
            let JsonRpcMessage::Request(req) = peer.recv().await else {
                panic!("expected request");
            };
            assert!(matches!(&req.id, RequestId::String(s) if s.ends_with("-1")));
            peer.send(JsonRpcResponse::ok(req.id, json!(2)).into()).await;
        });
        let v: Value = session.send_request("fast/op", None).await.expect("reply");
        assert_eq!(v, json!(2));
        peer_task.await.expect("peer");
    }

    #[tokio::test]
    async fn unknown_inbound_request_gets_method_not_found_with_hint() {
        let (_session, mut peer) =
            session_with_peer(Duration::from_secs(5), HashMap::new(), HashMap::new()).await;

        peer.send(
            JsonRpcRequest::new(RequestId::from("s-3"), methods::ROOTS_LIST, Some(json!({})))
                .into(),
        )
        .await;

        let JsonRpcMessage::Response(resp) = peer.recv().await else {
            panic!("expected response");
        };
        assert_eq!(resp.id, RequestId::from("s-3"));
        let error = resp.error.expect("error");
        assert_eq!(error.code, error_codes::METHOD_NOT_FOUND);
        assert_eq!(error.message, "Roots not supported");
        assert_eq!(
            error.data,
            Some(json!({"reason": "Client does not have roots capability"}))
        );
    }

    #[tokio::test]
    async fn registered_request_handler_produces_response() {
        let mut handlers: HashMap<String, RequestHandler> = HashMap::new();
        handlers.insert(
            "echo".to_string(),
            Arc::new(|params| {
                Box::pin(async move { Ok(params.unwrap_or(Value::Null)) })
            }),
        );
        let (_session, mut peer) =
            session_with_peer(Duration::from_secs(5), handlers, HashMap::new()).await;

        peer.send(
            JsonRpcRequest::new(RequestId::from(1), "echo", Some(json!({"x": 1}))).into(),
        )
        .await;

        let JsonRpcMessage::Response(resp) = peer.recv().await else {
            panic!("expected response");
        };
        assert_eq!(resp.result, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn failing_request_handler_becomes_internal_error() {
        let mut handlers: HashMap<String, RequestHandler> = HashMap::new();
        handlers.insert(
            "explode".to_string(),
            Arc::new(|_| Box::pin(async { Err(McpError::Internal("boom".to_string())) })),
        );
        let (_session, mut peer) =
            session_with_peer(Duration::from_secs(5), handlers, HashMap::new()).await;

        peer.send(JsonRpcRequest::new(RequestId::from(9), "explode", None).into())
            .await;

        let JsonRpcMessage::Response(resp) = peer.recv().await else {
            panic!("expected response");
        };
        assert_eq!(resp.id, RequestId::from(9));
        let error = resp.error.expect("error");
        assert_eq!(error.code, error_codes::INTERNAL_ERROR);
        assert_eq!(error.message, "boom");
    }

    #[tokio::test]
    async fn notifications_are_observed_in_send_order() {
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::channel::<()>(16);

        let seen_in_handler = seen.clone();
        let mut handlers: HashMap<String, NotificationHandler> = HashMap::new();
        handlers.insert(
            "tick".to_string(),
            Arc::new(move |params| {
                let seen = seen_in_handler.clone();
                let done = done_tx.clone();
                Box::pin(async move {
                    let n = params.and_then(|p| p.get("n").and_then(Value::as_i64)).unwrap();
                    seen.lock().expect("seen").push(n);
                    let _ = done.send(()).await;
                    Ok(())
                })
            }),
        );
        let (_session, peer) =
            session_with_peer(Duration::from_secs(5), HashMap::new(), handlers).await;

        for n in 0..10 {
            peer.send(JsonRpcNotification::new("tick", Some(json!({"n": n}))).into())
                .await;
        }
        for _ in 0..10 {
            done_rx.recv().await.expect("handled");
        }
        assert_eq!(*seen.lock().expect("seen"), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn close_fails_pending_waiters_and_is_idempotent() {
        let (session, _peer) =
            session_with_peer(Duration::from_secs(30), HashMap::new(), HashMap::new()).await;
        let session = Arc::new(session);

        let requester = {
            let session = session.clone();
            tokio::spawn(async move { session.send_request::<Value>("never", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        session.close();
        session.close();

        let err = requester.await.expect("join").expect_err("closed");
        assert!(matches!(err, McpError::SessionClosed));
        assert!(matches!(
            session.send_request::<Value>("after", None).await,
            Err(McpError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn full_outbound_queue_reports_backpressure() {
        let (near, _far) = crate::test_support::pipe_with_capacity(1);
        // Nobody drains the far end: the second send finds the queue full.
        near.send(JsonRpcNotification::new("a", None).into())
            .await
            .expect("first buffered");
        let err = near
            .send(JsonRpcNotification::new("b", None).into())
            .await
            .expect_err("queue full");
        assert!(matches!(err, crate::TransportError::Backpressure));
    }
}
