use async_trait::async_trait;
use parley_schema::JsonRpcMessage;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Capacity of the bounded inbound/outbound queues. A full outbound queue
/// surfaces as [`TransportError::Backpressure`] at the `send` seam.
pub const CHANNEL_CAPACITY: usize = 64;

/// Moves opaque envelopes in one direction and releases resources on close.
///
/// `send` succeeds once the message is buffered for write; delivery is the
/// writer task's business. `close_gracefully` stops accepting new sends,
/// drains best-effort and completes even if the peer is unreachable. `close`
/// is immediate. Both are idempotent.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError>;

    async fn close_gracefully(&self);

    fn close(&self);
}

/// Client-side transport: a 1:1 binding to one peer that also produces the
/// inbound stream.
#[async_trait]
pub trait ClientTransport: Transport {
    /// Start inbound delivery. Decoded envelopes arrive on the returned
    /// channel in strict arrival order. Calling `connect` a second time
    /// fails with [`TransportError::AlreadyConnected`].
    async fn connect(&self) -> Result<mpsc::Receiver<JsonRpcMessage>, TransportError>;
}
