//! Embedder-supplied client behavior: the sampling handler and the
//! change/logging consumers invoked on server notifications.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parley_runtime::McpError;
use parley_schema::types::{
    CreateMessageRequest, CreateMessageResult, LoggingMessageNotification, Prompt, Resource, Tool,
};

/// Runs an LLM turn on the server's behalf. Required whenever the client
/// advertises the sampling capability.
pub type SamplingHandler = Arc<
    dyn Fn(CreateMessageRequest) -> BoxFuture<'static, Result<CreateMessageResult, McpError>>
        + Send
        + Sync,
>;

pub type ToolsChangeConsumer =
    Arc<dyn Fn(Vec<Tool>) -> BoxFuture<'static, Result<(), McpError>> + Send + Sync>;

pub type ResourcesChangeConsumer =
    Arc<dyn Fn(Vec<Resource>) -> BoxFuture<'static, Result<(), McpError>> + Send + Sync>;

pub type PromptsChangeConsumer =
    Arc<dyn Fn(Vec<Prompt>) -> BoxFuture<'static, Result<(), McpError>> + Send + Sync>;

pub type LoggingConsumer = Arc<
    dyn Fn(LoggingMessageNotification) -> BoxFuture<'static, Result<(), McpError>> + Send + Sync,
>;

#[derive(Clone, Default)]
pub struct ClientFeatures {
    pub sampling_handler: Option<SamplingHandler>,
    pub tools_change_consumers: Vec<ToolsChangeConsumer>,
    pub resources_change_consumers: Vec<ResourcesChangeConsumer>,
    pub prompts_change_consumers: Vec<PromptsChangeConsumer>,
    pub logging_consumers: Vec<LoggingConsumer>,
}

pub fn sampling_handler<F, Fut>(handler: F) -> SamplingHandler
where
    F: Fn(CreateMessageRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CreateMessageResult, McpError>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(handler(request)))
}

pub fn tools_change_consumer<F, Fut>(consumer: F) -> ToolsChangeConsumer
where
    F: Fn(Vec<Tool>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), McpError>> + Send + 'static,
{
    Arc::new(move |tools| Box::pin(consumer(tools)))
}

pub fn resources_change_consumer<F, Fut>(consumer: F) -> ResourcesChangeConsumer
where
    F: Fn(Vec<Resource>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), McpError>> + Send + 'static,
{
    Arc::new(move |resources| Box::pin(consumer(resources)))
}

pub fn prompts_change_consumer<F, Fut>(consumer: F) -> PromptsChangeConsumer
where
    F: Fn(Vec<Prompt>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), McpError>> + Send + 'static,
{
    Arc::new(move |prompts| Box::pin(consumer(prompts)))
}

pub fn logging_consumer<F, Fut>(consumer: F) -> LoggingConsumer
where
    F: Fn(LoggingMessageNotification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), McpError>> + Send + 'static,
{
    Arc::new(move |notification| Box::pin(consumer(notification)))
}
