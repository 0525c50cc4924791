//! HTTP+SSE client transport.
//!
//! The server streams envelopes to us over a long-lived `GET <base><sse>`
//! event stream; we post outgoing envelopes as JSON bodies to the message
//! endpoint the server names in its initial `endpoint` event. Sends block
//! until that event has been seen, bounded by a configurable wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parley_schema::{JsonRpcMessage, SseEventParser};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;
use crate::transport::{ClientTransport, Transport, CHANNEL_CAPACITY};

pub const DEFAULT_SSE_ENDPOINT: &str = "/sse";

/// How long `send` waits for endpoint discovery before failing.
pub const DEFAULT_ENDPOINT_WAIT: Duration = Duration::from_secs(10);

const MESSAGE_EVENT_TYPE: &str = "message";
const ENDPOINT_EVENT_TYPE: &str = "endpoint";

/// Statuses the server may answer a message POST with.
const ACCEPTED_STATUSES: [u16; 4] = [200, 201, 202, 206];

#[derive(Debug, Clone)]
pub struct SseClientOptions {
    pub base_url: Url,
    pub sse_endpoint: String,
    pub endpoint_wait: Duration,
}

impl SseClientOptions {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            sse_endpoint: DEFAULT_SSE_ENDPOINT.to_string(),
            endpoint_wait: DEFAULT_ENDPOINT_WAIT,
        }
    }
}

pub struct SseClientTransport {
    http: reqwest::Client,
    options: SseClientOptions,
    endpoint_tx: watch::Sender<Option<Url>>,
    endpoint_rx: watch::Receiver<Option<Url>>,
    closing: AtomicBool,
    connected: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseClientTransport {
    pub fn new(options: SseClientOptions) -> Result<Self, TransportError> {
        // No overall timeout: the SSE stream lives for the whole session.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        Ok(Self {
            http,
            options,
            endpoint_tx,
            endpoint_rx,
            closing: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            reader: Mutex::new(None),
        })
    }

    async fn message_endpoint(&self) -> Result<Url, TransportError> {
        let mut rx = self.endpoint_rx.clone();
        let discovered = tokio::time::timeout(
            self.options.endpoint_wait,
            rx.wait_for(Option::is_some),
        )
        .await
        .map_err(|_| {
            TransportError::NotReady("message endpoint not discovered in time".to_string())
        })?
        .map_err(|_| TransportError::Closed)?;
        Ok(discovered.clone().expect("endpoint present"))
    }
}

#[async_trait]
impl Transport for SseClientTransport {
    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let endpoint = self.message_endpoint().await?;

        let response = self
            .http
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(&message)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        if !ACCEPTED_STATUSES.contains(&status) {
            return Err(TransportError::Status(status));
        }
        Ok(())
    }

    async fn close_gracefully(&self) {
        self.close();
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(task) = self.reader.lock().expect("reader handle").take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ClientTransport for SseClientTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<JsonRpcMessage>, TransportError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }

        let sse_url = self
            .options
            .base_url
            .join(&self.options.sse_endpoint)?;

        let response = self
            .http
            .get(sse_url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        // A non-2xx status on connect is fatal.
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let base_url = self.options.base_url.clone();
        let endpoint_tx = self.endpoint_tx.clone();

        let reader = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseEventParser::new();
            let mut pending = Vec::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "sse stream failed");
                        break;
                    }
                };

                // Feed only the complete UTF-8 prefix; the rest waits for
                // the next chunk.
                pending.extend_from_slice(&bytes);
                let valid = match std::str::from_utf8(&pending) {
                    Ok(text) => text.len(),
                    Err(e) => e.valid_up_to(),
                };
                let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
                pending.drain(..valid);

                for event in parser.feed(&text) {
                    match event.event.as_str() {
                        ENDPOINT_EVENT_TYPE => match base_url.join(event.data.trim()) {
                            Ok(url) => {
                                debug!(endpoint = %url, "discovered message endpoint");
                                endpoint_tx.send_replace(Some(url));
                            }
                            Err(e) => warn!(error = %e, data = %event.data, "invalid endpoint event"),
                        },
                        MESSAGE_EVENT_TYPE => match serde_json::from_str::<JsonRpcMessage>(&event.data)
                        {
                            Ok(message) => {
                                if inbound_tx.send(message).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping undecodable sse message"),
                        },
                        other => warn!(event = other, "unrecognized sse event type"),
                    }
                }
            }
        });

        *self.reader.lock().expect("reader handle") = Some(reader);
        Ok(inbound_rx)
    }
}
