//! Thin synchronous wrapper over the async client, plus adapters that lift
//! blocking embedder callbacks onto tokio's blocking pool so synchronous
//! user code never stalls the session's cooperative reader.

use std::sync::Arc;

use parley_runtime::{ClientTransport, McpError};
use parley_schema::types::{
    CallToolRequest, CallToolResult, CompleteRequest, CompleteResult, CreateMessageRequest,
    CreateMessageResult, GetPromptRequest, GetPromptResult, InitializeResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    LoggingLevel, LoggingMessageNotification, Prompt, ReadResourceRequest, ReadResourceResult,
    Resource, Root, SubscribeRequest, Tool, UnsubscribeRequest,
};
use serde_json::Value;

use crate::features::{
    LoggingConsumer, PromptsChangeConsumer, ResourcesChangeConsumer, SamplingHandler,
    ToolsChangeConsumer,
};
use crate::{ClientConfig, ClientFeatures, McpClient};

/// Blocking MCP client. Owns a runtime and awaits the async core; no
/// protocol logic lives here.
pub struct BlockingMcpClient {
    runtime: tokio::runtime::Runtime,
    inner: McpClient,
}

impl BlockingMcpClient {
    pub fn connect(
        transport: Arc<dyn ClientTransport>,
        config: ClientConfig,
        features: ClientFeatures,
    ) -> Result<Self, McpError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| McpError::Internal(format!("failed to start runtime: {e}")))?;
        let inner = runtime.block_on(McpClient::connect(transport, config, features))?;
        Ok(Self { runtime, inner })
    }

    pub fn initialize(&self) -> Result<InitializeResult, McpError> {
        self.runtime.block_on(self.inner.initialize())
    }

    pub fn ping(&self) -> Result<Value, McpError> {
        self.runtime.block_on(self.inner.ping())
    }

    pub fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult, McpError> {
        self.runtime.block_on(self.inner.list_tools(cursor))
    }

    pub fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResult, McpError> {
        self.runtime.block_on(self.inner.call_tool(request))
    }

    pub fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult, McpError> {
        self.runtime.block_on(self.inner.list_resources(cursor))
    }

    pub fn read_resource(
        &self,
        request: ReadResourceRequest,
    ) -> Result<ReadResourceResult, McpError> {
        self.runtime.block_on(self.inner.read_resource(request))
    }

    pub fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        self.runtime
            .block_on(self.inner.list_resource_templates(cursor))
    }

    pub fn subscribe_resource(&self, request: SubscribeRequest) -> Result<(), McpError> {
        self.runtime.block_on(self.inner.subscribe_resource(request))
    }

    pub fn unsubscribe_resource(&self, request: UnsubscribeRequest) -> Result<(), McpError> {
        self.runtime
            .block_on(self.inner.unsubscribe_resource(request))
    }

    pub fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult, McpError> {
        self.runtime.block_on(self.inner.list_prompts(cursor))
    }

    pub fn get_prompt(&self, request: GetPromptRequest) -> Result<GetPromptResult, McpError> {
        self.runtime.block_on(self.inner.get_prompt(request))
    }

    pub fn set_logging_level(&self, level: LoggingLevel) -> Result<(), McpError> {
        self.runtime.block_on(self.inner.set_logging_level(level))
    }

    pub fn complete(&self, request: CompleteRequest) -> Result<CompleteResult, McpError> {
        self.runtime.block_on(self.inner.complete(request))
    }

    pub fn add_root(&self, root: Root) -> Result<(), McpError> {
        self.runtime.block_on(self.inner.add_root(root))
    }

    pub fn remove_root(&self, uri: &str) -> Result<(), McpError> {
        self.runtime.block_on(self.inner.remove_root(uri))
    }

    pub fn roots(&self) -> Vec<Root> {
        self.inner.roots()
    }

    pub fn close_gracefully(&self) {
        self.runtime.block_on(self.inner.close_gracefully());
    }

    pub fn close(&self) {
        self.inner.close();
    }

    /// Access the async client, e.g. to share the session with async code.
    pub fn get(&self) -> &McpClient {
        &self.inner
    }
}

// ---------------------------------------------------------------------
// Blocking-callback adapters
// ---------------------------------------------------------------------

fn offload<T, F>(callback: Arc<F>, value: T) -> futures::future::BoxFuture<'static, Result<(), McpError>>
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    Box::pin(async move {
        tokio::task::spawn_blocking(move || callback(value))
            .await
            .map_err(|e| McpError::Internal(format!("blocking consumer panicked: {e}")))
    })
}

/// Adapt a blocking sampling callback.
pub fn blocking_sampling_handler<F>(handler: F) -> SamplingHandler
where
    F: Fn(CreateMessageRequest) -> Result<CreateMessageResult, McpError> + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |request| {
        let handler = handler.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || handler(request))
                .await
                .map_err(|e| McpError::Internal(format!("blocking sampling handler panicked: {e}")))?
        })
    })
}

pub fn blocking_tools_change_consumer<F>(consumer: F) -> ToolsChangeConsumer
where
    F: Fn(Vec<Tool>) + Send + Sync + 'static,
{
    let consumer = Arc::new(consumer);
    Arc::new(move |tools| offload(consumer.clone(), tools))
}

pub fn blocking_resources_change_consumer<F>(consumer: F) -> ResourcesChangeConsumer
where
    F: Fn(Vec<Resource>) + Send + Sync + 'static,
{
    let consumer = Arc::new(consumer);
    Arc::new(move |resources| offload(consumer.clone(), resources))
}

pub fn blocking_prompts_change_consumer<F>(consumer: F) -> PromptsChangeConsumer
where
    F: Fn(Vec<Prompt>) + Send + Sync + 'static,
{
    let consumer = Arc::new(consumer);
    Arc::new(move |prompts| offload(consumer.clone(), prompts))
}

pub fn blocking_logging_consumer<F>(consumer: F) -> LoggingConsumer
where
    F: Fn(LoggingMessageNotification) + Send + Sync + 'static,
{
    let consumer = Arc::new(consumer);
    Arc::new(move |notification| offload(consumer.clone(), notification))
}
