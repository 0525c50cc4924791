//! HTTP+SSE session provider: accepts many concurrent clients, gives each a
//! session bound to its own SSE stream, and broadcasts across all of them.
//!
//! Two routes share a base URL: `GET <sse_endpoint>` opens the downstream
//! event channel (first frame is the `endpoint` event naming the message
//! URL for this session), and `POST <message_endpoint>?sessionId=…` carries
//! client-to-server envelopes.
//!
//! Error routing policy: transport and decode failures are answered in the
//! POST body as JSON-RPC error objects; handler failures that correlate to a
//! request id travel as JSON-RPC error responses over the SSE channel while
//! the POST still returns 200.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::join_all;
use parley_runtime::{
    McpError, ServerSession, SessionFactory, Transport, TransportError, CHANNEL_CAPACITY,
};
use parley_schema::error_codes;
use parley_schema::jsonrpc::{JsonRpcError, JsonRpcMessage};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ServerTransportProvider;

pub const DEFAULT_SSE_ENDPOINT: &str = "/sse";
pub const DEFAULT_MESSAGE_ENDPOINT: &str = "/message";

#[derive(Debug, Clone)]
pub struct SseServerOptions {
    /// Prefix emitted in the `endpoint` event, e.g. a public base URL.
    /// Usually empty so clients resolve the path against the URL they
    /// connected to.
    pub base_url: String,
    pub sse_endpoint: String,
    pub message_endpoint: String,
}

impl Default for SseServerOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            sse_endpoint: DEFAULT_SSE_ENDPOINT.to_string(),
            message_endpoint: DEFAULT_MESSAGE_ENDPOINT.to_string(),
        }
    }
}

pub struct SseServerProvider {
    options: SseServerOptions,
    factory: OnceLock<SessionFactory>,
    sessions: RwLock<HashMap<String, Arc<ServerSession>>>,
    closing: AtomicBool,
}

impl SseServerProvider {
    pub fn new(options: SseServerOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            factory: OnceLock::new(),
            sessions: RwLock::new(HashMap::new()),
            closing: AtomicBool::new(false),
        })
    }

    /// Build the axum router serving both endpoints.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&self.options.sse_endpoint, get(sse_connect))
            .route(&self.options.message_endpoint, post(post_message))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().expect("session map").len()
    }

    fn active_sessions(&self) -> Vec<Arc<ServerSession>> {
        self.sessions
            .read()
            .expect("session map")
            .values()
            .cloned()
            .collect()
    }

    fn drop_session(&self, session_id: &str) {
        let removed = self
            .sessions
            .write()
            .expect("session map")
            .remove(session_id);
        if let Some(session) = removed {
            debug!(session = session_id, "client disconnected, closing session");
            session.close();
        }
    }
}

#[async_trait]
impl ServerTransportProvider for SseServerProvider {
    fn set_session_factory(&self, factory: SessionFactory) {
        if self.factory.set(factory).is_err() {
            warn!("session factory already set, ignoring replacement");
        }
    }

    async fn notify_clients(&self, method: &str, params: Option<Value>) {
        let sessions = self.active_sessions();
        if sessions.is_empty() {
            debug!(method, "no active sessions to broadcast to");
            return;
        }
        debug!(method, sessions = sessions.len(), "broadcasting notification");
        for session in sessions {
            if let Err(e) = session.send_notification(method, params.clone()).await {
                error!(session = session.id(), error = %e, "failed to notify session");
            }
        }
    }

    async fn close_gracefully(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let sessions: Vec<_> = self
            .sessions
            .write()
            .expect("session map")
            .drain()
            .map(|(_, s)| s)
            .collect();
        info!(sessions = sessions.len(), "shutting down sse provider");
        join_all(sessions.iter().map(|s| s.close_gracefully())).await;
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        for (_, session) in self.sessions.write().expect("session map").drain() {
            session.close();
        }
    }
}

/// Per-session server transport writing into the session's SSE channel.
struct SseSessionTransport {
    tx: mpsc::Sender<JsonRpcMessage>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for SseSessionTransport {
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

/// Removes the session from the provider map when the SSE stream is dropped,
/// which is how client disconnects surface here.
struct SessionGuard {
    provider: Arc<SseServerProvider>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.provider.drop_session(&self.session_id);
    }
}

async fn sse_connect(State(provider): State<Arc<SseServerProvider>>) -> Response {
    if provider.closing.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }
    let Some(factory) = provider.factory.get() else {
        error!("sse connection before the session factory was wired");
        return (StatusCode::INTERNAL_SERVER_ERROR, "server not ready").into_response();
    };

    let session_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);
    let transport = Arc::new(SseSessionTransport {
        tx,
        closed: AtomicBool::new(false),
    });

    let session = factory(transport);
    provider
        .sessions
        .write()
        .expect("session map")
        .insert(session_id.clone(), session);
    info!(session = %session_id, "client connected");

    let endpoint = format!(
        "{}{}?sessionId={}",
        provider.options.base_url, provider.options.message_endpoint, session_id
    );
    let guard = SessionGuard {
        provider: provider.clone(),
        session_id,
    };

    let endpoint_event =
        tokio_stream::once(Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint)));
    let messages = ReceiverStream::new(rx).map(move |message| {
        // Tying the guard to the stream scopes the session to the
        // connection lifetime.
        let _guard = &guard;
        let data = serde_json::to_string(&message).unwrap_or_else(|e| {
            error!(error = %e, "failed to serialize outbound message");
            String::new()
        });
        Ok::<_, Infallible>(Event::default().event("message").data(data))
    });

    Sse::new(endpoint_event.chain(messages))
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[derive(Debug, serde::Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn post_message(
    State(provider): State<Arc<SseServerProvider>>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Response {
    if provider.closing.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }

    let Some(session_id) = query.session_id else {
        return error_response(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_REQUEST,
            "Session ID missing in message endpoint",
        );
    };

    let session = provider
        .sessions
        .read()
        .expect("session map")
        .get(&session_id)
        .cloned();
    let Some(session) = session else {
        return error_response(
            StatusCode::NOT_FOUND,
            error_codes::INVALID_REQUEST,
            format!("Session not found: {session_id}"),
        );
    };

    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                error_codes::PARSE_ERROR,
                format!("parse error: {e}"),
            );
        }
    };
    let message = match JsonRpcMessage::from_value(value) {
        Ok(message) => message,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                error_codes::INVALID_REQUEST,
                e.to_string(),
            );
        }
    };

    match session.handle(message).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(McpError::SessionClosed) => error_response(
            StatusCode::NOT_FOUND,
            error_codes::INVALID_REQUEST,
            format!("Session closed: {session_id}"),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            e.to_string(),
        ),
    }
}

fn error_response(
    status: StatusCode,
    code: i64,
    message: impl Into<String>,
) -> Response {
    (status, Json(JsonRpcError::new(code, message))).into_response()
}
