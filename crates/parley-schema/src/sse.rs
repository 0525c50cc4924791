//! Minimal server-sent-events decoder for the MCP HTTP binding.
//!
//! Understands the subset of the SSE grammar the protocol uses: `event:`,
//! `data:` and `id:` fields, `:` comments, blank-line event terminators, and
//! multi-line `data:` joined with `\n`.

/// One decoded SSE event. `event` defaults to `"message"` per the SSE spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental decoder: feed arbitrary chunk boundaries, get complete events.
#[derive(Debug, Default)]
pub struct SseEventParser {
    buf: String,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseEventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every event completed by it. Partial lines
    /// and half-built events stay buffered for the next call.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        while let Some(nl) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=nl).collect();
            let line = line.trim_end_matches(|c| c == '\n' || c == '\r');

            if line.is_empty() {
                if self.event.is_some() || !self.data.is_empty() || self.id.is_some() {
                    out.push(self.take_event());
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            if let Some(rest) = line.strip_prefix("event:") {
                self.event = Some(rest.trim_start().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.trim_start().to_string());
            } else if let Some(rest) = line.strip_prefix("id:") {
                self.id = Some(rest.trim_start().to_string());
            }
            // Unknown fields are ignored.
        }

        out
    }

    fn take_event(&mut self) -> SseEvent {
        SseEvent {
            event: self
                .event
                .take()
                .unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
        }
    }
}

/// Decode a complete SSE body in one pass. A trailing unterminated event is
/// flushed, which suits buffered response bodies.
pub fn decode_sse_events(body: &str) -> Vec<SseEvent> {
    let mut parser = SseEventParser::new();
    let mut events = parser.feed(body);
    if !body.ends_with('\n') {
        events.extend(parser.feed("\n\n"));
    } else {
        events.extend(parser.feed("\n"));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_event() {
        let events = decode_sse_events("event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "message".to_string(),
                data: "{\"jsonrpc\":\"2.0\"}".to_string(),
                id: None,
            }]
        );
    }

    #[test]
    fn endpoint_event_with_session_id() {
        let events = decode_sse_events("event: endpoint\ndata: /messages?sessionId=abc123\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?sessionId=abc123");
    }

    #[test]
    fn joins_multiline_data() {
        let events = decode_sse_events("data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn ignores_comments_and_unknown_fields() {
        let events = decode_sse_events(": keep-alive\nretry: 100\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn handles_crlf_line_endings() {
        let events = decode_sse_events("event: message\r\ndata: hi\r\n\r\n");
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn event_type_defaults_to_message() {
        let events = decode_sse_events("data: hi\n\n");
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn incremental_feed_across_chunk_boundaries() {
        let mut parser = SseEventParser::new();
        assert!(parser.feed("event: end").is_empty());
        assert!(parser.feed("point\ndata: /messages?session").is_empty());
        let events = parser.feed("Id=1\n\nevent: message\ndata: {}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?sessionId=1");
        assert_eq!(events[1].event, "message");
        assert_eq!(events[1].data, "{}");
    }

    #[test]
    fn carries_event_id() {
        let events = decode_sse_events("id: 9\ndata: x\n\n");
        assert_eq!(events[0].id.as_deref(), Some("9"));
    }
}
