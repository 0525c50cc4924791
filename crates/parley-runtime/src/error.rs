use parley_schema::error_codes;
use parley_schema::jsonrpc::JsonRpcError;
use serde_json::Value;
use thiserror::Error;

/// Failures at the byte-moving layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The bounded outbound queue is full. Transient: the caller may retry.
    #[error("outbound queue is full")]
    Backpressure,
    /// The transport has not finished its connection handshake, e.g. the SSE
    /// endpoint event has not arrived within the configured wait.
    #[error("transport not ready: {0}")]
    NotReady(String),
    #[error("transport already connected")]
    AlreadyConnected,
    #[error("transport is closed")]
    Closed,
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to spawn server process: {0}")]
    Spawn(String),
    #[error("http failure: {0}")]
    Http(String),
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),
}

/// Protocol-level error surface shared by both peers.
///
/// `Response` carries an error the remote peer encoded on the wire,
/// reconstructed with its original code/message/data. Every other variant is
/// raised locally, before or instead of wire traffic.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("json-rpc error {code}: {message}")]
    Response {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("{0}")]
    CapabilityMissing(String),
    #[error("{0}")]
    NotInitialized(String),
    #[error("unsupported protocol version from the server: {0}")]
    UnsupportedProtocolVersion(String),
    #[error("request timed out: {method}")]
    Timeout { method: String },
    #[error("session closed before a response arrived")]
    SessionClosed,
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    NotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("codec failure: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("{0}")]
    Internal(String),
}

impl McpError {
    pub fn from_json_rpc(error: JsonRpcError) -> Self {
        McpError::Response {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }

    /// Wire form of this error, used when a handler outcome has to travel
    /// back as a JSON-RPC error response. Remote errors keep their original
    /// code; local validation failures map to the closest reserved code and
    /// everything else is an internal error carrying the message.
    pub fn to_json_rpc(&self) -> JsonRpcError {
        match self {
            McpError::Response {
                code,
                message,
                data,
            } => JsonRpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            McpError::InvalidParams(_) => {
                JsonRpcError::new(error_codes::INVALID_PARAMS, self.to_string())
            }
            McpError::Codec(_) => {
                JsonRpcError::new(error_codes::INVALID_PARAMS, self.to_string())
            }
            _ => JsonRpcError::new(error_codes::INTERNAL_ERROR, self.to_string()),
        }
    }
}
