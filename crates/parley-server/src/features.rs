//! Feature specifications: the entities a server registers, each pairing its
//! discovery metadata with the handler invoked on dispatch.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parley_runtime::{McpError, ServerExchange};
use parley_schema::types::{
    CallToolResult, CompleteReference, CompleteRequest, CompleteResult, GetPromptRequest,
    GetPromptResult, Prompt, ReadResourceRequest, ReadResourceResult, Resource, ResourceTemplate,
    Root, Tool,
};
use serde_json::Value;

pub type ToolHandler = Arc<
    dyn Fn(ServerExchange, Option<Value>) -> BoxFuture<'static, Result<CallToolResult, McpError>>
        + Send
        + Sync,
>;

pub type ResourceHandler = Arc<
    dyn Fn(
            ServerExchange,
            ReadResourceRequest,
        ) -> BoxFuture<'static, Result<ReadResourceResult, McpError>>
        + Send
        + Sync,
>;

pub type PromptHandler = Arc<
    dyn Fn(ServerExchange, GetPromptRequest) -> BoxFuture<'static, Result<GetPromptResult, McpError>>
        + Send
        + Sync,
>;

pub type CompletionHandler = Arc<
    dyn Fn(ServerExchange, CompleteRequest) -> BoxFuture<'static, Result<CompleteResult, McpError>>
        + Send
        + Sync,
>;

/// Invoked with the refreshed roots list whenever a client reports a roots
/// change.
pub type RootsChangeConsumer = Arc<
    dyn Fn(ServerExchange, Vec<Root>) -> BoxFuture<'static, Result<(), McpError>> + Send + Sync,
>;

/// A tool and the handler `tools/call` dispatches to. Keyed by `tool.name`.
#[derive(Clone)]
pub struct ToolSpec {
    pub tool: Tool,
    pub handler: ToolHandler,
}

impl ToolSpec {
    pub fn new<F, Fut>(tool: Tool, handler: F) -> Self
    where
        F: Fn(ServerExchange, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult, McpError>> + Send + 'static,
    {
        Self {
            tool,
            handler: Arc::new(move |exchange, args| Box::pin(handler(exchange, args))),
        }
    }
}

/// A resource and the handler `resources/read` dispatches to. Keyed by
/// `resource.uri`.
#[derive(Clone)]
pub struct ResourceSpec {
    pub resource: Resource,
    pub handler: ResourceHandler,
}

impl ResourceSpec {
    pub fn new<F, Fut>(resource: Resource, handler: F) -> Self
    where
        F: Fn(ServerExchange, ReadResourceRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReadResourceResult, McpError>> + Send + 'static,
    {
        Self {
            resource,
            handler: Arc::new(move |exchange, request| Box::pin(handler(exchange, request))),
        }
    }
}

/// A prompt and the handler `prompts/get` dispatches to. Keyed by
/// `prompt.name`.
#[derive(Clone)]
pub struct PromptSpec {
    pub prompt: Prompt,
    pub handler: PromptHandler,
}

impl PromptSpec {
    pub fn new<F, Fut>(prompt: Prompt, handler: F) -> Self
    where
        F: Fn(ServerExchange, GetPromptRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GetPromptResult, McpError>> + Send + 'static,
    {
        Self {
            prompt,
            handler: Arc::new(move |exchange, request| Box::pin(handler(exchange, request))),
        }
    }
}

/// A completion handler keyed by the `(refType, refId)` reference it serves.
#[derive(Clone)]
pub struct CompletionSpec {
    pub reference: CompleteReference,
    pub handler: CompletionHandler,
}

impl CompletionSpec {
    pub fn new<F, Fut>(reference: CompleteReference, handler: F) -> Self
    where
        F: Fn(ServerExchange, CompleteRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CompleteResult, McpError>> + Send + 'static,
    {
        Self {
            reference,
            handler: Arc::new(move |exchange, request| Box::pin(handler(exchange, request))),
        }
    }
}

/// Everything a server is born with. Further tools/resources/prompts can be
/// added and removed at runtime through the server handle.
#[derive(Clone, Default)]
pub struct ServerFeatures {
    pub tools: Vec<ToolSpec>,
    pub resources: Vec<ResourceSpec>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<PromptSpec>,
    pub completions: Vec<CompletionSpec>,
    pub roots_change_consumers: Vec<RootsChangeConsumer>,
}
