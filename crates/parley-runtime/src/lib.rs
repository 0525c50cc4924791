//! Session layer and transport bindings for the parley MCP runtime.
//!
//! The session layer multiplexes concurrent request/response pairs and
//! notifications over one bidirectional transport, matches responses to
//! waiters by request id, applies per-request timeouts and coordinates
//! shutdown. It is symmetric: [`ClientSession`] and [`ServerSession`] share
//! the same pending-response machinery and differ in their handler tables
//! and lifecycle rules.
//!
//! Two transport bindings ship here: line-delimited JSON over a child
//! process's stdio ([`StdioClientTransport`]) and the HTTP+SSE pairing
//! ([`SseClientTransport`]); the server side of the HTTP binding lives in
//! `parley-server` because it is multi-session by construction.

pub mod client_session;
pub mod error;
mod pending;
pub mod server_session;
pub mod sse_client;
pub mod stdio;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use client_session::{
    ClientSession, NotificationHandler, RequestHandler, DEFAULT_REQUEST_TIMEOUT,
};
pub use error::{McpError, TransportError};
pub use server_session::{
    InitRequestHandler, ServerExchange, ServerNotificationHandler, ServerRequestHandler,
    ServerSession, SessionFactory,
};
pub use sse_client::{
    SseClientOptions, SseClientTransport, DEFAULT_ENDPOINT_WAIT, DEFAULT_SSE_ENDPOINT,
};
pub use stdio::{ServerParameters, StdioClientTransport};
pub use transport::{ClientTransport, Transport, CHANNEL_CAPACITY};
