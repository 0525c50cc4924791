//! Line-oriented envelope codec for the stdio binding.
//!
//! One envelope per line. serde_json escapes control characters inside string
//! values, so an embedded `\n` in a payload serializes as `\\n` and the frame
//! itself never contains a literal newline; [`encode_line`] still refuses to
//! hand out a frame that would break the delimiter.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::jsonrpc::{InvalidMessage, JsonRpcMessage};

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("serialized message contains a literal newline")]
    EmbeddedNewline,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Malformed bytes; maps to JSON-RPC `-32700`.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// Well-formed JSON that matches none of the envelope shapes; maps to
    /// JSON-RPC `-32600`.
    #[error(transparent)]
    Invalid(#[from] InvalidMessage),
}

/// Serialize an envelope to a single line of JSON (without the trailing `\n`).
pub fn encode_line(message: &JsonRpcMessage) -> Result<String, EncodeError> {
    let text = serde_json::to_string(message)?;
    if text.contains('\n') || text.contains('\r') {
        return Err(EncodeError::EmbeddedNewline);
    }
    Ok(text)
}

/// Parse one line into an envelope, distinguishing syntactic parse errors
/// from structurally invalid messages.
pub fn decode_line(line: &str) -> Result<JsonRpcMessage, DecodeError> {
    let value: Value = serde_json::from_str(line)?;
    Ok(JsonRpcMessage::from_value(value)?)
}

/// Convert raw `params`/`result` JSON into a typed value. Absent payloads
/// decode from `null`.
pub fn from_value<T: DeserializeOwned>(value: Option<Value>) -> Result<T, serde_json::Error> {
    serde_json::from_value(value.unwrap_or(Value::Null))
}

/// Like [`from_value`], but an absent payload yields `T::default()`. Used for
/// requests whose params object is optional, e.g. paginated lists.
pub fn from_value_or_default<T: DeserializeOwned + Default>(
    value: Option<Value>,
) -> Result<T, serde_json::Error> {
    match value {
        Some(Value::Null) | None => Ok(T::default()),
        Some(v) => serde_json::from_value(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, RequestId};
    use crate::types::{CallToolResult, Content, PaginatedRequest};
    use serde_json::json;

    #[test]
    fn embedded_newlines_are_escaped_on_the_wire() {
        let result = CallToolResult {
            content: vec![Content::text("line1\nline2")],
            is_error: Some(false),
        };
        let msg = JsonRpcMessage::Response(JsonRpcResponse::ok(
            RequestId::from("c-1"),
            serde_json::to_value(&result).expect("to_value"),
        ));

        let line = encode_line(&msg).expect("encode");
        assert!(!line.contains('\n'));
        assert!(line.contains(r"line1\nline2"));

        // The reader restores the embedded newline after JSON parsing.
        let JsonRpcMessage::Response(back) = decode_line(&line).expect("decode") else {
            panic!("expected response");
        };
        let decoded: CallToolResult =
            from_value(back.result).expect("decode result");
        assert_eq!(decoded.content, vec![Content::text("line1\nline2")]);
    }

    #[test]
    fn parse_error_and_invalid_request_are_distinct() {
        assert!(matches!(decode_line("{not json"), Err(DecodeError::Parse(_))));
        assert!(matches!(
            decode_line(r#"{"jsonrpc":"2.0","id":1}"#),
            Err(DecodeError::Invalid(_))
        ));
    }

    #[test]
    fn decode_round_trip() {
        let msg = JsonRpcMessage::Request(JsonRpcRequest::new(
            RequestId::from(5),
            "tools/list",
            Some(json!({"cursor": "abc"})),
        ));
        let line = encode_line(&msg).expect("encode");
        let JsonRpcMessage::Request(req) = decode_line(&line).expect("decode") else {
            panic!("expected request");
        };
        let params: PaginatedRequest = from_value(req.params).expect("params");
        assert_eq!(params.cursor.as_deref(), Some("abc"));
    }

    #[test]
    fn absent_params_decode_as_default() {
        let params: PaginatedRequest = from_value_or_default(None).expect("decode");
        assert!(params.cursor.is_none());

        let params: PaginatedRequest =
            from_value_or_default(Some(json!({"cursor": "x"}))).expect("decode");
        assert_eq!(params.cursor.as_deref(), Some("x"));
    }
}
