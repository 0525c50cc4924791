//! MCP server face: the method surface on top of the session layer, the
//! dynamic registries behind it, and the session providers that fan many
//! clients into one server.
//!
//! Registries are process-wide and shared read-mostly by every session;
//! dispatch iterates over clones so readers never block writers. Mutations
//! take the registry's write lock, which serializes concurrent duplicate
//! inserts down to exactly one winner.

pub mod blocking;
pub mod features;
pub mod sse_provider;
pub mod stdio_provider;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parley_runtime::{
    InitRequestHandler, McpError, ServerNotificationHandler, ServerRequestHandler, ServerSession,
    SessionFactory, DEFAULT_REQUEST_TIMEOUT,
};
use parley_schema::types::{
    CallToolRequest, CompleteReference, CompleteRequest, GetPromptRequest, Implementation,
    InitializeResult, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, ReadResourceRequest, ResourceTemplate, ServerCapabilities, SetLevelRequest,
    SubscribeRequest, UnsubscribeRequest,
};
use parley_schema::{methods, LATEST_PROTOCOL_VERSION};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use features::{
    CompletionSpec, PromptSpec, ResourceSpec, RootsChangeConsumer, ServerFeatures, ToolSpec,
};
pub use sse_provider::{SseServerOptions, SseServerProvider};
pub use stdio_provider::StdioServerProvider;

/// Server-side factory seam: accepts incoming connections, binds each to a
/// fresh [`ServerSession`], and fans notifications out across all of them.
#[async_trait]
pub trait ServerTransportProvider: Send + Sync {
    /// Wire the session factory. The core invokes this exactly once while
    /// constructing the server, before any client connects.
    fn set_session_factory(&self, factory: SessionFactory);

    /// Send a notification to every active session. Per-session failures are
    /// logged and never abort the broadcast.
    async fn notify_clients(&self, method: &str, params: Option<Value>);

    async fn close_gracefully(&self);

    fn close(&self);
}

/// Server identity, capabilities and protocol knobs.
#[derive(Clone)]
pub struct ServerConfig {
    pub server_info: Implementation,
    pub capabilities: ServerCapabilities,
    pub instructions: Option<String>,
    /// Supported protocol revisions, preferred version last.
    pub protocol_versions: Vec<String>,
    pub request_timeout: Duration,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            server_info: Implementation::new(name, version),
            capabilities: ServerCapabilities::default(),
            instructions: None,
            protocol_versions: vec![LATEST_PROTOCOL_VERSION.to_string()],
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    fn validate(&self) -> Result<(), McpError> {
        if self.protocol_versions.is_empty() {
            return Err(McpError::Internal(
                "server config needs at least one protocol version".to_string(),
            ));
        }
        Ok(())
    }
}

struct ServerCore {
    config: ServerConfig,
    tools: RwLock<Vec<ToolSpec>>,
    resources: RwLock<Vec<ResourceSpec>>,
    resource_templates: RwLock<Vec<ResourceTemplate>>,
    prompts: RwLock<Vec<PromptSpec>>,
    completions: RwLock<Vec<CompletionSpec>>,
    roots_change_consumers: Vec<RootsChangeConsumer>,
}

/// The MCP server: owns the registries and drives change notifications
/// through its transport provider.
pub struct McpServer {
    core: Arc<ServerCore>,
    provider: Arc<dyn ServerTransportProvider>,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer").finish_non_exhaustive()
    }
}

impl McpServer {
    pub fn new(
        provider: Arc<dyn ServerTransportProvider>,
        config: ServerConfig,
        features: ServerFeatures,
    ) -> Result<Self, McpError> {
        config.validate()?;

        let core = Arc::new(ServerCore {
            config,
            tools: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            resource_templates: RwLock::new(features.resource_templates),
            prompts: RwLock::new(Vec::new()),
            completions: RwLock::new(Vec::new()),
            roots_change_consumers: features.roots_change_consumers,
        });

        for tool in features.tools {
            insert_unique(
                &core.tools,
                tool,
                |s: &ToolSpec| s.tool.name.clone(),
                "Tool with name",
            )?;
        }
        for resource in features.resources {
            insert_unique(
                &core.resources,
                resource,
                |s: &ResourceSpec| s.resource.uri.clone(),
                "Resource with URI",
            )?;
        }
        for prompt in features.prompts {
            insert_unique(
                &core.prompts,
                prompt,
                |s: &PromptSpec| s.prompt.name.clone(),
                "Prompt with name",
            )?;
        }
        for completion in features.completions {
            let exists = core
                .completions
                .read()
                .expect("completions registry")
                .iter()
                .any(|s| s.reference == completion.reference);
            if exists {
                return Err(McpError::AlreadyExists(format!(
                    "Completion for reference {:?} already exists",
                    completion.reference
                )));
            }
            core.completions
                .write()
                .expect("completions registry")
                .push(completion);
        }

        let init_handler = initialize_request_handler(&core);
        let request_handlers = build_request_handlers(&core);
        let notification_handlers = build_notification_handlers(&core);
        let request_timeout = core.config.request_timeout;

        let factory: SessionFactory = Arc::new(move |transport| {
            ServerSession::create(
                Uuid::new_v4().to_string(),
                transport,
                request_timeout,
                init_handler.clone(),
                request_handlers.clone(),
                notification_handlers.clone(),
            )
        });
        provider.set_session_factory(factory);

        Ok(Self { core, provider })
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.core.config.capabilities
    }

    pub fn server_info(&self) -> &Implementation {
        &self.core.config.server_info
    }

    // -----------------------------------------------------------------
    // Tools
    // -----------------------------------------------------------------

    pub async fn add_tool(&self, spec: ToolSpec) -> Result<(), McpError> {
        let caps = self.require_tools_capability()?;
        insert_unique(
            &self.core.tools,
            spec,
            |s: &ToolSpec| s.tool.name.clone(),
            "Tool with name",
        )?;
        if caps.list_changed.unwrap_or(false) {
            self.notify_tools_list_changed().await;
        }
        Ok(())
    }

    pub async fn remove_tool(&self, name: &str) -> Result<(), McpError> {
        let caps = self.require_tools_capability()?;
        remove_by_key(&self.core.tools, name, |s: &ToolSpec| s.tool.name.clone())
            .ok_or_else(|| McpError::NotFound(format!("Tool with name '{name}' not found")))?;
        if caps.list_changed.unwrap_or(false) {
            self.notify_tools_list_changed().await;
        }
        Ok(())
    }

    pub async fn notify_tools_list_changed(&self) {
        self.provider
            .notify_clients(methods::NOTIFICATION_TOOLS_LIST_CHANGED, None)
            .await;
    }

    fn require_tools_capability(
        &self,
    ) -> Result<&parley_schema::types::ToolsCapability, McpError> {
        self.core.config.capabilities.tools.as_ref().ok_or_else(|| {
            McpError::CapabilityMissing(
                "Server must be configured with tool capabilities".to_string(),
            )
        })
    }

    // -----------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------

    pub async fn add_resource(&self, spec: ResourceSpec) -> Result<(), McpError> {
        let caps = self.require_resources_capability()?;
        insert_unique(
            &self.core.resources,
            spec,
            |s: &ResourceSpec| s.resource.uri.clone(),
            "Resource with URI",
        )?;
        if caps.list_changed.unwrap_or(false) {
            self.notify_resources_list_changed().await;
        }
        Ok(())
    }

    pub async fn remove_resource(&self, uri: &str) -> Result<(), McpError> {
        let caps = self.require_resources_capability()?;
        remove_by_key(&self.core.resources, uri, |s: &ResourceSpec| {
            s.resource.uri.clone()
        })
        .ok_or_else(|| McpError::NotFound(format!("Resource with URI '{uri}' not found")))?;
        if caps.list_changed.unwrap_or(false) {
            self.notify_resources_list_changed().await;
        }
        Ok(())
    }

    pub async fn notify_resources_list_changed(&self) {
        self.provider
            .notify_clients(methods::NOTIFICATION_RESOURCES_LIST_CHANGED, None)
            .await;
    }

    fn require_resources_capability(
        &self,
    ) -> Result<&parley_schema::types::ResourcesCapability, McpError> {
        self.core
            .config
            .capabilities
            .resources
            .as_ref()
            .ok_or_else(|| {
                McpError::CapabilityMissing(
                    "Server must be configured with resource capabilities".to_string(),
                )
            })
    }

    // -----------------------------------------------------------------
    // Prompts
    // -----------------------------------------------------------------

    pub async fn add_prompt(&self, spec: PromptSpec) -> Result<(), McpError> {
        let caps = self.require_prompts_capability()?;
        insert_unique(
            &self.core.prompts,
            spec,
            |s: &PromptSpec| s.prompt.name.clone(),
            "Prompt with name",
        )?;
        if caps.list_changed.unwrap_or(false) {
            self.notify_prompts_list_changed().await;
        }
        Ok(())
    }

    pub async fn remove_prompt(&self, name: &str) -> Result<(), McpError> {
        let caps = self.require_prompts_capability()?;
        remove_by_key(&self.core.prompts, name, |s: &PromptSpec| {
            s.prompt.name.clone()
        })
        .ok_or_else(|| McpError::NotFound(format!("Prompt with name '{name}' not found")))?;
        if caps.list_changed.unwrap_or(false) {
            self.notify_prompts_list_changed().await;
        }
        Ok(())
    }

    pub async fn notify_prompts_list_changed(&self) {
        self.provider
            .notify_clients(methods::NOTIFICATION_PROMPTS_LIST_CHANGED, None)
            .await;
    }

    fn require_prompts_capability(
        &self,
    ) -> Result<&parley_schema::types::PromptsCapability, McpError> {
        self.core
            .config
            .capabilities
            .prompts
            .as_ref()
            .ok_or_else(|| {
                McpError::CapabilityMissing(
                    "Server must be configured with prompt capabilities".to_string(),
                )
            })
    }

    // -----------------------------------------------------------------
    // Completions
    // -----------------------------------------------------------------

    pub fn add_completion(&self, spec: CompletionSpec) -> Result<(), McpError> {
        let mut registry = self.core.completions.write().expect("completions registry");
        if registry.iter().any(|s| s.reference == spec.reference) {
            return Err(McpError::AlreadyExists(format!(
                "Completion for reference {:?} already exists",
                spec.reference
            )));
        }
        registry.push(spec);
        Ok(())
    }

    pub fn remove_completion(&self, reference: &CompleteReference) -> Result<(), McpError> {
        let mut registry = self.core.completions.write().expect("completions registry");
        let before = registry.len();
        registry.retain(|s| &s.reference != reference);
        if registry.len() == before {
            return Err(McpError::NotFound(format!(
                "Completion for reference {reference:?} not found"
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    pub async fn close_gracefully(&self) {
        self.provider.close_gracefully().await;
    }

    pub fn close(&self) {
        self.provider.close();
    }
}

fn insert_unique<T: Clone>(
    registry: &RwLock<Vec<T>>,
    value: T,
    key: impl Fn(&T) -> String,
    kind: &str,
) -> Result<(), McpError> {
    let mut registry = registry.write().expect("registry");
    let new_key = key(&value);
    if registry.iter().any(|existing| key(existing) == new_key) {
        return Err(McpError::AlreadyExists(format!(
            "{kind} '{new_key}' already exists"
        )));
    }
    registry.push(value);
    Ok(())
}

fn remove_by_key<T>(
    registry: &RwLock<Vec<T>>,
    key_value: &str,
    key: impl Fn(&T) -> String,
) -> Option<T> {
    let mut registry = registry.write().expect("registry");
    let index = registry.iter().position(|v| key(v) == key_value)?;
    Some(registry.remove(index))
}

// ---------------------------------------------------------------------
// Handler wiring
// ---------------------------------------------------------------------

fn initialize_request_handler(core: &Arc<ServerCore>) -> InitRequestHandler {
    let core = core.clone();
    Arc::new(move |request| {
        let core = core.clone();
        Box::pin(async move {
            info!(
                version = %request.protocol_version,
                client = %request.client_info.name,
                "client initialize request"
            );

            // Echo the requested version when supported; otherwise offer the
            // server's own highest.
            let supported = &core.config.protocol_versions;
            let protocol_version = if supported.contains(&request.protocol_version) {
                request.protocol_version
            } else {
                let offered = supported.last().expect("validated non-empty").clone();
                warn!(
                    requested = %request.protocol_version,
                    offered = %offered,
                    "client requested an unsupported protocol version"
                );
                offered
            };

            Ok(InitializeResult {
                protocol_version,
                capabilities: core.config.capabilities.clone(),
                server_info: core.config.server_info.clone(),
                instructions: core.config.instructions.clone(),
            })
        })
    })
}

fn build_request_handlers(core: &Arc<ServerCore>) -> HashMap<String, ServerRequestHandler> {
    let mut handlers: HashMap<String, ServerRequestHandler> = HashMap::new();
    let caps = &core.config.capabilities;

    if caps.tools.is_some() {
        handlers.insert(methods::TOOLS_LIST.to_string(), tools_list_handler(core));
        handlers.insert(methods::TOOLS_CALL.to_string(), tools_call_handler(core));
    }

    if let Some(resources) = &caps.resources {
        handlers.insert(
            methods::RESOURCES_LIST.to_string(),
            resources_list_handler(core),
        );
        handlers.insert(
            methods::RESOURCES_READ.to_string(),
            resources_read_handler(core),
        );
        handlers.insert(
            methods::RESOURCES_TEMPLATES_LIST.to_string(),
            resource_templates_list_handler(core),
        );
        if resources.subscribe.unwrap_or(false) {
            handlers.insert(
                methods::RESOURCES_SUBSCRIBE.to_string(),
                resources_subscribe_handler(),
            );
            handlers.insert(
                methods::RESOURCES_UNSUBSCRIBE.to_string(),
                resources_unsubscribe_handler(),
            );
        }
    }

    if caps.prompts.is_some() {
        handlers.insert(methods::PROMPTS_LIST.to_string(), prompts_list_handler(core));
        handlers.insert(methods::PROMPTS_GET.to_string(), prompts_get_handler(core));
    }

    if caps.logging.is_some() {
        handlers.insert(
            methods::LOGGING_SET_LEVEL.to_string(),
            logging_set_level_handler(),
        );
    }

    if caps.completions.is_some() {
        handlers.insert(
            methods::COMPLETION_COMPLETE.to_string(),
            completion_complete_handler(core),
        );
    }

    handlers
}

fn build_notification_handlers(
    core: &Arc<ServerCore>,
) -> HashMap<String, ServerNotificationHandler> {
    let mut handlers: HashMap<String, ServerNotificationHandler> = HashMap::new();
    handlers.insert(
        methods::NOTIFICATION_ROOTS_LIST_CHANGED.to_string(),
        roots_list_changed_handler(core),
    );
    handlers
}

fn decode_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, McpError> {
    parley_schema::from_value(params).map_err(|e| McpError::InvalidParams(e.to_string()))
}

fn tools_list_handler(core: &Arc<ServerCore>) -> ServerRequestHandler {
    let core = core.clone();
    Arc::new(move |_exchange, _params| {
        let core = core.clone();
        Box::pin(async move {
            let tools = core
                .tools
                .read()
                .expect("tools registry")
                .iter()
                .map(|spec| spec.tool.clone())
                .collect();
            Ok(serde_json::to_value(ListToolsResult {
                tools,
                next_cursor: None,
            })?)
        })
    })
}

fn tools_call_handler(core: &Arc<ServerCore>) -> ServerRequestHandler {
    let core = core.clone();
    Arc::new(move |exchange, params| {
        let core = core.clone();
        Box::pin(async move {
            let request: CallToolRequest = decode_params(params)?;
            let spec = core
                .tools
                .read()
                .expect("tools registry")
                .iter()
                .find(|spec| spec.tool.name == request.name)
                .cloned();
            let Some(spec) = spec else {
                return Err(McpError::NotFound(format!(
                    "Tool not found: {}",
                    request.name
                )));
            };
            let result = (spec.handler)(exchange, request.arguments).await?;
            Ok(serde_json::to_value(result)?)
        })
    })
}

fn resources_list_handler(core: &Arc<ServerCore>) -> ServerRequestHandler {
    let core = core.clone();
    Arc::new(move |_exchange, _params| {
        let core = core.clone();
        Box::pin(async move {
            let resources = core
                .resources
                .read()
                .expect("resources registry")
                .iter()
                .map(|spec| spec.resource.clone())
                .collect();
            Ok(serde_json::to_value(ListResourcesResult {
                resources,
                next_cursor: None,
            })?)
        })
    })
}

fn resources_read_handler(core: &Arc<ServerCore>) -> ServerRequestHandler {
    let core = core.clone();
    Arc::new(move |exchange, params| {
        let core = core.clone();
        Box::pin(async move {
            let request: ReadResourceRequest = decode_params(params)?;
            let spec = core
                .resources
                .read()
                .expect("resources registry")
                .iter()
                .find(|spec| spec.resource.uri == request.uri)
                .cloned();
            let Some(spec) = spec else {
                return Err(McpError::NotFound(format!(
                    "Resource not found: {}",
                    request.uri
                )));
            };
            let result = (spec.handler)(exchange, request).await?;
            Ok(serde_json::to_value(result)?)
        })
    })
}

fn resource_templates_list_handler(core: &Arc<ServerCore>) -> ServerRequestHandler {
    let core = core.clone();
    Arc::new(move |_exchange, _params| {
        let core = core.clone();
        Box::pin(async move {
            let resource_templates = core
                .resource_templates
                .read()
                .expect("template registry")
                .clone();
            Ok(serde_json::to_value(ListResourceTemplatesResult {
                resource_templates,
                next_cursor: None,
            })?)
        })
    })
}

fn resources_subscribe_handler() -> ServerRequestHandler {
    Arc::new(move |exchange, params| {
        Box::pin(async move {
            let request: SubscribeRequest = decode_params(params)?;
            exchange.subscribe(request.uri);
            Ok(json!({}))
        })
    })
}

fn resources_unsubscribe_handler() -> ServerRequestHandler {
    Arc::new(move |exchange, params| {
        Box::pin(async move {
            let request: UnsubscribeRequest = decode_params(params)?;
            exchange.unsubscribe(&request.uri);
            Ok(json!({}))
        })
    })
}

fn prompts_list_handler(core: &Arc<ServerCore>) -> ServerRequestHandler {
    let core = core.clone();
    Arc::new(move |_exchange, _params| {
        let core = core.clone();
        Box::pin(async move {
            let prompts = core
                .prompts
                .read()
                .expect("prompts registry")
                .iter()
                .map(|spec| spec.prompt.clone())
                .collect();
            Ok(serde_json::to_value(ListPromptsResult {
                prompts,
                next_cursor: None,
            })?)
        })
    })
}

fn prompts_get_handler(core: &Arc<ServerCore>) -> ServerRequestHandler {
    let core = core.clone();
    Arc::new(move |exchange, params| {
        let core = core.clone();
        Box::pin(async move {
            let request: GetPromptRequest = decode_params(params)?;
            let spec = core
                .prompts
                .read()
                .expect("prompts registry")
                .iter()
                .find(|spec| spec.prompt.name == request.name)
                .cloned();
            let Some(spec) = spec else {
                return Err(McpError::NotFound(format!(
                    "Prompt not found: {}",
                    request.name
                )));
            };
            let result = (spec.handler)(exchange, request).await?;
            Ok(serde_json::to_value(result)?)
        })
    })
}

fn logging_set_level_handler() -> ServerRequestHandler {
    Arc::new(move |exchange, params| {
        Box::pin(async move {
            let request: SetLevelRequest = decode_params(params)?;
            exchange.set_min_logging_level(request.level);
            Ok(json!({}))
        })
    })
}

fn completion_complete_handler(core: &Arc<ServerCore>) -> ServerRequestHandler {
    let core = core.clone();
    Arc::new(move |exchange, params| {
        let core = core.clone();
        Box::pin(async move {
            let request: CompleteRequest = decode_params(params)?;

            // The referenced target must exist before any dispatch happens.
            match &request.reference {
                CompleteReference::Prompt { name } => {
                    let known = core
                        .prompts
                        .read()
                        .expect("prompts registry")
                        .iter()
                        .any(|spec| &spec.prompt.name == name);
                    if !known {
                        return Err(McpError::NotFound(format!("Prompt not found: {name}")));
                    }
                }
                CompleteReference::Resource { uri } => {
                    let known = core
                        .resources
                        .read()
                        .expect("resources registry")
                        .iter()
                        .any(|spec| &spec.resource.uri == uri);
                    if !known {
                        return Err(McpError::NotFound(format!("Resource not found: {uri}")));
                    }
                }
            }

            let spec = core
                .completions
                .read()
                .expect("completions registry")
                .iter()
                .find(|spec| spec.reference == request.reference)
                .cloned();
            let Some(spec) = spec else {
                return Err(McpError::NotFound(format!(
                    "Completion not found for reference {:?}",
                    request.reference
                )));
            };
            let result = (spec.handler)(exchange, request).await?;
            Ok(serde_json::to_value(result)?)
        })
    })
}

fn roots_list_changed_handler(core: &Arc<ServerCore>) -> ServerNotificationHandler {
    let core = core.clone();
    Arc::new(move |exchange, _params| {
        let core = core.clone();
        Box::pin(async move {
            let result = exchange.list_roots(None).await?;
            if core.roots_change_consumers.is_empty() {
                warn!(
                    roots = result.roots.len(),
                    "roots list changed, but no consumers are registered"
                );
                return Ok(());
            }
            for consumer in &core.roots_change_consumers {
                if let Err(e) = consumer(exchange.clone(), result.roots.clone()).await {
                    error!(error = %e, "roots change consumer failed");
                }
            }
            Ok(())
        })
    })
}

/// Boxing helper for [`RootsChangeConsumer`] closures.
pub fn roots_change_consumer<F, Fut>(consumer: F) -> RootsChangeConsumer
where
    F: Fn(parley_runtime::ServerExchange, Vec<parley_schema::types::Root>) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: std::future::Future<Output = Result<(), McpError>> + Send + 'static,
{
    Arc::new(move |exchange, roots| {
        Box::pin(consumer(exchange, roots)) as BoxFuture<'static, Result<(), McpError>>
    })
}
