//! End-to-end coverage of the HTTP+SSE binding: endpoint discovery, message
//! POSTs answered over the event stream, broadcasts, and shutdown behavior.

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use parley_schema::jsonrpc::{JsonRpcMessage, JsonRpcRequest, RequestId};
use parley_schema::types::{
    CallToolResult, Content, InitializeResult, ListToolsResult, ServerCapabilities, Tool,
    ToolsCapability,
};
use parley_schema::{methods, SseEvent, SseEventParser};
use parley_server::{
    McpServer, ServerConfig, ServerFeatures, ServerTransportProvider, SseServerOptions,
    SseServerProvider, ToolSpec,
};
use serde_json::json;

struct SseStream {
    inner: std::pin::Pin<
        Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>,
    >,
    parser: SseEventParser,
    queued: std::collections::VecDeque<SseEvent>,
}

impl SseStream {
    async fn open(url: &str) -> anyhow::Result<Self> {
        let response = reqwest::Client::new()
            .get(url)
            .header("accept", "text/event-stream")
            .send()
            .await?;
        anyhow::ensure!(response.status().is_success(), "status {}", response.status());
        Ok(Self {
            inner: Box::pin(response.bytes_stream()),
            parser: SseEventParser::new(),
            queued: std::collections::VecDeque::new(),
        })
    }

    async fn next_event(&mut self) -> anyhow::Result<SseEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Ok(event);
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.inner.next())
                .await?
                .ok_or_else(|| anyhow::anyhow!("sse stream ended"))??;
            self.queued
                .extend(self.parser.feed(&String::from_utf8_lossy(&chunk)));
        }
    }

    /// Next `message` event decoded as an envelope (keep-alive comments are
    /// swallowed by the parser already).
    async fn next_message(&mut self) -> anyhow::Result<JsonRpcMessage> {
        loop {
            let event = self.next_event().await?;
            if event.event == "message" {
                return Ok(serde_json::from_str(&event.data)?);
            }
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_server() -> anyhow::Result<(SocketAddr, std::sync::Arc<SseServerProvider>, McpServer)>
{
    init_tracing();
    let provider = SseServerProvider::new(SseServerOptions::default());

    let mut config = ServerConfig::new("sse-server", "0.0.0");
    config.capabilities = ServerCapabilities {
        tools: Some(ToolsCapability {
            list_changed: Some(true),
        }),
        ..Default::default()
    };
    let features = ServerFeatures {
        tools: vec![ToolSpec::new(
            Tool {
                name: "greet".to_string(),
                description: Some("greets the caller".to_string()),
                input_schema: json!({"type": "object"}),
            },
            |_exchange, args| async move {
                let who = args
                    .as_ref()
                    .and_then(|a| a.get("who"))
                    .and_then(|w| w.as_str())
                    .unwrap_or("world")
                    .to_string();
                Ok(CallToolResult {
                    content: vec![Content::text(format!("hello {who}"))],
                    is_error: Some(false),
                })
            },
        )],
        ..Default::default()
    };
    let server = McpServer::new(provider.clone(), config, features)?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = provider.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok((addr, provider, server))
}

fn initialize_body() -> String {
    serde_json::to_string(&json!({
        "jsonrpc": "2.0",
        "id": "c-0",
        "method": "initialize",
        "params": {
            "protocolVersion": parley_schema::LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "x", "version": "1"}
        }
    }))
    .expect("body")
}

async fn post(message_url: &str, body: String) -> anyhow::Result<reqwest::StatusCode> {
    let response = reqwest::Client::new()
        .post(message_url)
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await?;
    Ok(response.status())
}

#[tokio::test]
async fn endpoint_discovery_and_request_reply_over_sse() -> anyhow::Result<()> {
    let (addr, _provider, _server) = start_server().await?;

    let mut stream = SseStream::open(&format!("http://{addr}/sse")).await?;
    let endpoint = stream.next_event().await?;
    assert_eq!(endpoint.event, "endpoint");
    assert!(endpoint.data.starts_with("/message?sessionId="));

    let message_url = format!("http://{addr}{}", endpoint.data);

    // Handshake over POST; replies stream back on the SSE channel.
    assert_eq!(post(&message_url, initialize_body()).await?, 200);
    let JsonRpcMessage::Response(response) = stream.next_message().await? else {
        panic!("expected response");
    };
    assert_eq!(response.id, RequestId::from("c-0"));
    let init: InitializeResult = serde_json::from_value(response.result.expect("result"))?;
    assert_eq!(init.protocol_version, parley_schema::LATEST_PROTOCOL_VERSION);

    assert_eq!(
        post(
            &message_url,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string()
        )
        .await?,
        200
    );

    let call = serde_json::to_string(&JsonRpcMessage::Request(JsonRpcRequest::new(
        RequestId::from("c-1"),
        methods::TOOLS_CALL,
        Some(json!({"name": "greet", "arguments": {"who": "sse"}})),
    )))?;
    assert_eq!(post(&message_url, call).await?, 200);

    let JsonRpcMessage::Response(response) = stream.next_message().await? else {
        panic!("expected response");
    };
    assert_eq!(response.id, RequestId::from("c-1"));
    let result: CallToolResult = serde_json::from_value(response.result.expect("result"))?;
    assert_eq!(result.content, vec![Content::text("hello sse")]);
    Ok(())
}

#[tokio::test]
async fn unknown_session_and_bad_bodies_get_typed_errors() -> anyhow::Result<()> {
    let (addr, _provider, _server) = start_server().await?;

    // Unknown session id.
    let status = post(
        &format!("http://{addr}/message?sessionId=nope"),
        initialize_body(),
    )
    .await?;
    assert_eq!(status, 404);

    // Missing session id entirely.
    let status = post(&format!("http://{addr}/message"), initialize_body()).await?;
    assert_eq!(status, 400);

    // Real session, unparseable body.
    let mut stream = SseStream::open(&format!("http://{addr}/sse")).await?;
    let endpoint = stream.next_event().await?;
    let message_url = format!("http://{addr}{}", endpoint.data);

    let response = reqwest::Client::new()
        .post(&message_url)
        .body("{not json")
        .send()
        .await?;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body.get("code"), Some(&json!(-32700)));

    // Well-formed JSON that is not an envelope.
    let response = reqwest::Client::new()
        .post(&message_url)
        .body(r#"{"jsonrpc":"2.0","id":1}"#)
        .send()
        .await?;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body.get("code"), Some(&json!(-32600)));
    Ok(())
}

#[tokio::test]
async fn broadcasts_reach_every_connected_session() -> anyhow::Result<()> {
    let (addr, provider, server) = start_server().await?;

    let mut first = SseStream::open(&format!("http://{addr}/sse")).await?;
    let mut second = SseStream::open(&format!("http://{addr}/sse")).await?;
    let _ = first.next_event().await?;
    let _ = second.next_event().await?;
    assert_eq!(provider.session_count(), 2);

    server
        .add_tool(ToolSpec::new(
            Tool {
                name: "late".to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
            },
            |_exchange, _args| async move {
                Ok(CallToolResult {
                    content: Vec::new(),
                    is_error: Some(false),
                })
            },
        ))
        .await?;

    for stream in [&mut first, &mut second] {
        let JsonRpcMessage::Notification(n) = stream.next_message().await? else {
            panic!("expected notification");
        };
        assert_eq!(n.method, methods::NOTIFICATION_TOOLS_LIST_CHANGED);
    }

    // A follow-up list from one session sees the new tool.
    let endpoint_data = {
        let mut stream = SseStream::open(&format!("http://{addr}/sse")).await?;
        let endpoint = stream.next_event().await?;
        let message_url = format!("http://{addr}{}", endpoint.data);
        assert_eq!(post(&message_url, initialize_body()).await?, 200);
        let _ = stream.next_message().await?;
        assert_eq!(
            post(
                &message_url,
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string()
            )
            .await?,
            200
        );
        let list = serde_json::to_string(&JsonRpcMessage::Request(JsonRpcRequest::new(
            RequestId::from("c-2"),
            methods::TOOLS_LIST,
            None,
        )))?;
        assert_eq!(post(&message_url, list).await?, 200);
        let JsonRpcMessage::Response(response) = stream.next_message().await? else {
            panic!("expected response");
        };
        let result: ListToolsResult = serde_json::from_value(response.result.expect("result"))?;
        result
            .tools
            .iter()
            .map(|t| t.name.clone())
            .collect::<Vec<_>>()
    };
    assert!(endpoint_data.contains(&"late".to_string()));
    Ok(())
}

#[tokio::test]
async fn graceful_shutdown_rejects_new_connections() -> anyhow::Result<()> {
    let (addr, provider, server) = start_server().await?;

    let mut stream = SseStream::open(&format!("http://{addr}/sse")).await?;
    let endpoint = stream.next_event().await?;
    let message_url = format!("http://{addr}{}", endpoint.data);

    server.close_gracefully().await;
    assert_eq!(provider.session_count(), 0);

    // New SSE connects are refused.
    let response = reqwest::Client::new()
        .get(format!("http://{addr}/sse"))
        .send()
        .await?;
    assert_eq!(response.status(), 503);

    // Posts are refused too.
    assert_eq!(post(&message_url, initialize_body()).await?, 503);
    Ok(())
}
