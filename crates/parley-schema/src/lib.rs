//! JSON-RPC 2.0 envelopes and Model Context Protocol (MCP) domain types.
//!
//! This crate is the wire vocabulary shared by the session layer, the
//! transports, and both protocol faces:
//! - [`jsonrpc`]: the three envelope shapes and their discrimination rules;
//! - [`types`]: the MCP schema (capabilities, tools, resources, prompts,
//!   completions, roots, sampling, logging);
//! - [`codec`]: line-oriented encode/decode used by the stdio binding;
//! - [`sse`]: the server-sent-events grammar used by the HTTP binding.

pub mod codec;
pub mod jsonrpc;
pub mod sse;
pub mod types;

pub use codec::{
    decode_line, encode_line, from_value, from_value_or_default, DecodeError, EncodeError,
};
pub use jsonrpc::{
    InvalidMessage, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId,
};
pub use sse::{decode_sse_events, SseEvent, SseEventParser};

/// The only JSON-RPC version this runtime speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// Latest MCP protocol revision supported by this implementation.
pub const LATEST_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error codes reserved by MCP. Application-defined codes outside
/// this set propagate unchanged.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Lifecycle violation: a request arrived before the session finished
    /// the initialize handshake.
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
}

/// MCP method names.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";

    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";

    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";

    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";

    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";

    pub const ROOTS_LIST: &str = "roots/list";
    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";

    pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIFICATION_MESSAGE: &str = "notifications/message";
    pub const NOTIFICATION_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const NOTIFICATION_RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const NOTIFICATION_RESOURCES_UPDATED: &str = "notifications/resources/updated";
    pub const NOTIFICATION_PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const NOTIFICATION_ROOTS_LIST_CHANGED: &str = "notifications/roots/list_changed";
}
