//! MCP client face: drives the initialize handshake, gates every operation
//! on the readiness latch and the negotiated server capabilities, and exposes
//! the typed method surface plus the client-held roots registry.

pub mod blocking;
pub mod config;
pub mod features;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;

use parley_runtime::{
    ClientSession, ClientTransport, McpError, NotificationHandler, RequestHandler,
};
use parley_schema::types::{
    CallToolRequest, CallToolResult, ClientCapabilities, CompleteRequest, CompleteResult,
    GetPromptRequest, GetPromptResult, Implementation, InitializeRequest, InitializeResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListRootsResult,
    ListToolsResult, LoggingLevel, LoggingMessageNotification, PaginatedRequest,
    ReadResourceRequest, ReadResourceResult, Root, ServerCapabilities, SetLevelRequest,
    SubscribeRequest, UnsubscribeRequest,
};
use parley_schema::methods;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, warn};

pub use config::{ClientConfig, DEFAULT_INITIALIZATION_TIMEOUT};
pub use features::{
    logging_consumer, prompts_change_consumer, resources_change_consumer, sampling_handler,
    tools_change_consumer, ClientFeatures, LoggingConsumer, PromptsChangeConsumer,
    ResourcesChangeConsumer, SamplingHandler, ToolsChangeConsumer,
};

/// Asynchronous MCP client bound 1:1 to a transport.
///
/// Cloning is cheap and shares the underlying session.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient").finish_non_exhaustive()
    }
}

struct ClientInner {
    session: ClientSession,
    client_info: Implementation,
    client_capabilities: ClientCapabilities,
    protocol_versions: Vec<String>,
    initialization_timeout: Duration,
    roots: Arc<RwLock<HashMap<String, Root>>>,
    init_tx: watch::Sender<Option<Arc<InitializeResult>>>,
    init_rx: watch::Receiver<Option<Arc<InitializeResult>>>,
}

impl McpClient {
    /// Wire handlers, connect the transport and start the session. The
    /// handshake itself is a separate step: call [`Self::initialize`].
    pub async fn connect(
        transport: Arc<dyn ClientTransport>,
        config: ClientConfig,
        features: ClientFeatures,
    ) -> Result<Self, McpError> {
        if config.protocol_versions.is_empty() {
            return Err(McpError::Internal(
                "client config needs at least one protocol version".to_string(),
            ));
        }
        if config.capabilities.sampling.is_some() && features.sampling_handler.is_none() {
            return Err(McpError::Internal(
                "sampling handler is required when client capabilities include sampling"
                    .to_string(),
            ));
        }

        let roots: Arc<RwLock<HashMap<String, Root>>> = Arc::new(RwLock::new(HashMap::new()));
        {
            let mut map = roots.write().expect("roots map");
            for root in config.roots {
                if map.insert(root.uri.clone(), root.clone()).is_some() {
                    return Err(McpError::AlreadyExists(format!(
                        "Root with uri '{}' already exists",
                        root.uri
                    )));
                }
            }
        }

        // Handlers are wired before the inner handle exists; they reach it
        // through this slot once construction completes.
        let slot: Arc<OnceLock<Weak<ClientInner>>> = Arc::new(OnceLock::new());

        let request_handlers =
            build_request_handlers(&config.capabilities, &features, roots.clone());
        let notification_handlers = build_notification_handlers(&features, slot.clone());

        let session = ClientSession::connect(
            transport,
            config.request_timeout,
            request_handlers,
            notification_handlers,
        )
        .await?;

        let (init_tx, init_rx) = watch::channel(None);
        let inner = Arc::new(ClientInner {
            session,
            client_info: config.client_info,
            client_capabilities: config.capabilities,
            protocol_versions: config.protocol_versions,
            initialization_timeout: config.initialization_timeout,
            roots,
            init_tx,
            init_rx,
        });
        let _ = slot.set(Arc::downgrade(&inner));

        Ok(Self { inner })
    }

    // -----------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------

    /// Run the initialize handshake: propose the preferred protocol version,
    /// validate the server's reply against the supported list, then report
    /// readiness with `notifications/initialized` and open the latch.
    pub async fn initialize(&self) -> Result<InitializeResult, McpError> {
        if self.is_initialized() {
            return Err(McpError::Internal("client already initialized".to_string()));
        }

        let preferred = self
            .inner
            .protocol_versions
            .last()
            .expect("validated non-empty")
            .clone();
        let request = InitializeRequest {
            protocol_version: preferred,
            capabilities: self.inner.client_capabilities.clone(),
            client_info: self.inner.client_info.clone(),
        };

        let result: InitializeResult = self
            .inner
            .session
            .send_request(methods::INITIALIZE, Some(serde_json::to_value(request)?))
            .await?;

        debug!(
            version = %result.protocol_version,
            server = %result.server_info.name,
            "server initialize response"
        );

        if !self
            .inner
            .protocol_versions
            .contains(&result.protocol_version)
        {
            return Err(McpError::UnsupportedProtocolVersion(
                result.protocol_version,
            ));
        }

        self.inner
            .session
            .send_notification(methods::NOTIFICATION_INITIALIZED, None)
            .await?;
        self.inner
            .init_tx
            .send_replace(Some(Arc::new(result.clone())));

        Ok(result)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.init_rx.borrow().is_some()
    }

    pub fn client_capabilities(&self) -> &ClientCapabilities {
        &self.inner.client_capabilities
    }

    pub fn client_info(&self) -> &Implementation {
        &self.inner.client_info
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.inner
            .init_rx
            .borrow()
            .as_ref()
            .map(|state| state.capabilities.clone())
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.inner
            .init_rx
            .borrow()
            .as_ref()
            .map(|state| state.server_info.clone())
    }

    pub fn server_instructions(&self) -> Option<String> {
        self.inner
            .init_rx
            .borrow()
            .as_ref()
            .and_then(|state| state.instructions.clone())
    }

    /// Wait on the readiness latch, bounded by the initialization timeout.
    async fn ready(&self, action: &str) -> Result<Arc<InitializeResult>, McpError> {
        let mut rx = self.inner.init_rx.clone();
        let state = tokio::time::timeout(
            self.inner.initialization_timeout,
            rx.wait_for(|state| state.is_some()),
        )
        .await
        .map_err(|_| {
            McpError::NotInitialized(format!("Client must be initialized before {action}"))
        })?
        .map_err(|_| McpError::SessionClosed)?;
        Ok(state.clone().expect("latch open"))
    }

    // -----------------------------------------------------------------
    // Basic utilities
    // -----------------------------------------------------------------

    pub async fn ping(&self) -> Result<Value, McpError> {
        self.ready("pinging the server").await?;
        self.inner.session.send_request(methods::PING, None).await
    }

    pub async fn close_gracefully(&self) {
        self.inner.session.close_gracefully().await;
    }

    pub fn close(&self) {
        self.inner.session.close();
    }

    // -----------------------------------------------------------------
    // Tools
    // -----------------------------------------------------------------

    pub async fn list_tools(
        &self,
        cursor: Option<String>,
    ) -> Result<ListToolsResult, McpError> {
        let state = self.ready("listing tools").await?;
        require_capability(state.capabilities.tools.is_some(), "tools")?;
        self.inner
            .session
            .send_request(
                methods::TOOLS_LIST,
                Some(serde_json::to_value(PaginatedRequest::new(cursor))?),
            )
            .await
    }

    pub async fn call_tool(&self, request: CallToolRequest) -> Result<CallToolResult, McpError> {
        let state = self.ready("calling tools").await?;
        require_capability(state.capabilities.tools.is_some(), "tools")?;
        self.inner
            .session
            .send_request(methods::TOOLS_CALL, Some(serde_json::to_value(request)?))
            .await
    }

    // -----------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------

    pub async fn list_resources(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourcesResult, McpError> {
        let state = self.ready("listing resources").await?;
        require_capability(state.capabilities.resources.is_some(), "resources")?;
        self.inner
            .session
            .send_request(
                methods::RESOURCES_LIST,
                Some(serde_json::to_value(PaginatedRequest::new(cursor))?),
            )
            .await
    }

    pub async fn read_resource(
        &self,
        request: ReadResourceRequest,
    ) -> Result<ReadResourceResult, McpError> {
        let state = self.ready("reading resources").await?;
        require_capability(state.capabilities.resources.is_some(), "resources")?;
        self.inner
            .session
            .send_request(
                methods::RESOURCES_READ,
                Some(serde_json::to_value(request)?),
            )
            .await
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        let state = self.ready("listing resource templates").await?;
        require_capability(state.capabilities.resources.is_some(), "resources")?;
        self.inner
            .session
            .send_request(
                methods::RESOURCES_TEMPLATES_LIST,
                Some(serde_json::to_value(PaginatedRequest::new(cursor))?),
            )
            .await
    }

    /// Register for change notifications on a resource.
    pub async fn subscribe_resource(&self, request: SubscribeRequest) -> Result<(), McpError> {
        let state = self.ready("subscribing to resources").await?;
        require_capability(state.capabilities.resources.is_some(), "resources")?;
        let _: Value = self
            .inner
            .session
            .send_request(
                methods::RESOURCES_SUBSCRIBE,
                Some(serde_json::to_value(request)?),
            )
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, request: UnsubscribeRequest) -> Result<(), McpError> {
        let state = self.ready("unsubscribing from resources").await?;
        require_capability(state.capabilities.resources.is_some(), "resources")?;
        let _: Value = self
            .inner
            .session
            .send_request(
                methods::RESOURCES_UNSUBSCRIBE,
                Some(serde_json::to_value(request)?),
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Prompts
    // -----------------------------------------------------------------

    pub async fn list_prompts(
        &self,
        cursor: Option<String>,
    ) -> Result<ListPromptsResult, McpError> {
        let state = self.ready("listing prompts").await?;
        require_capability(state.capabilities.prompts.is_some(), "prompts")?;
        self.inner
            .session
            .send_request(
                methods::PROMPTS_LIST,
                Some(serde_json::to_value(PaginatedRequest::new(cursor))?),
            )
            .await
    }

    pub async fn get_prompt(&self, request: GetPromptRequest) -> Result<GetPromptResult, McpError> {
        let state = self.ready("getting prompts").await?;
        require_capability(state.capabilities.prompts.is_some(), "prompts")?;
        self.inner
            .session
            .send_request(methods::PROMPTS_GET, Some(serde_json::to_value(request)?))
            .await
    }

    // -----------------------------------------------------------------
    // Logging & completion
    // -----------------------------------------------------------------

    /// Set the minimum level of `notifications/message` the server sends to
    /// this session.
    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<(), McpError> {
        self.ready("setting the logging level").await?;
        let _: Value = self
            .inner
            .session
            .send_request(
                methods::LOGGING_SET_LEVEL,
                Some(serde_json::to_value(SetLevelRequest { level })?),
            )
            .await?;
        Ok(())
    }

    pub async fn complete(&self, request: CompleteRequest) -> Result<CompleteResult, McpError> {
        self.ready("completing").await?;
        self.inner
            .session
            .send_request(
                methods::COMPLETION_COMPLETE,
                Some(serde_json::to_value(request)?),
            )
            .await
    }

    // -----------------------------------------------------------------
    // Roots
    // -----------------------------------------------------------------

    /// Add a root to the set advertised to the server. Sends
    /// `notifications/roots/list_changed` when so capable and initialized.
    pub async fn add_root(&self, root: Root) -> Result<(), McpError> {
        let caps = self.require_roots_capability()?;
        {
            let mut map = self.inner.roots.write().expect("roots map");
            if map.contains_key(&root.uri) {
                return Err(McpError::AlreadyExists(format!(
                    "Root with uri '{}' already exists",
                    root.uri
                )));
            }
            map.insert(root.uri.clone(), root);
        }
        self.notify_roots_changed_if_able(caps).await;
        Ok(())
    }

    pub async fn remove_root(&self, uri: &str) -> Result<(), McpError> {
        let caps = self.require_roots_capability()?;
        let removed = self.inner.roots.write().expect("roots map").remove(uri);
        if removed.is_none() {
            return Err(McpError::NotFound(format!(
                "Root with uri '{uri}' not found"
            )));
        }
        self.notify_roots_changed_if_able(caps).await;
        Ok(())
    }

    pub fn roots(&self) -> Vec<Root> {
        self.inner
            .roots
            .read()
            .expect("roots map")
            .values()
            .cloned()
            .collect()
    }

    /// Manually announce a roots change to the server.
    pub async fn roots_list_changed_notification(&self) -> Result<(), McpError> {
        self.ready("sending roots list changed notification")
            .await?;
        self.inner
            .session
            .send_notification(methods::NOTIFICATION_ROOTS_LIST_CHANGED, None)
            .await
    }

    fn require_roots_capability(&self) -> Result<bool, McpError> {
        match &self.inner.client_capabilities.roots {
            Some(caps) => Ok(caps.list_changed.unwrap_or(false)),
            None => Err(McpError::CapabilityMissing(
                "Client must be configured with roots capabilities".to_string(),
            )),
        }
    }

    async fn notify_roots_changed_if_able(&self, list_changed: bool) {
        if !list_changed {
            return;
        }
        if !self.is_initialized() {
            warn!("client not initialized, skipping roots list changed notification");
            return;
        }
        if let Err(e) = self.roots_list_changed_notification().await {
            error!(error = %e, "failed to send roots list changed notification");
        }
    }
}

fn require_capability(present: bool, family: &str) -> Result<(), McpError> {
    if present {
        Ok(())
    } else {
        Err(McpError::CapabilityMissing(format!(
            "Server does not provide the {family} capability"
        )))
    }
}

fn build_request_handlers(
    capabilities: &ClientCapabilities,
    features: &ClientFeatures,
    roots: Arc<RwLock<HashMap<String, Root>>>,
) -> HashMap<String, RequestHandler> {
    let mut handlers: HashMap<String, RequestHandler> = HashMap::new();

    if capabilities.roots.is_some() {
        handlers.insert(
            methods::ROOTS_LIST.to_string(),
            Arc::new(move |_params| {
                let roots = roots.clone();
                Box::pin(async move {
                    let roots: Vec<Root> =
                        roots.read().expect("roots map").values().cloned().collect();
                    Ok(serde_json::to_value(ListRootsResult { roots })?)
                })
            }),
        );
    }

    if capabilities.sampling.is_some() {
        let handler = features
            .sampling_handler
            .clone()
            .expect("validated: sampling handler present");
        handlers.insert(
            methods::SAMPLING_CREATE_MESSAGE.to_string(),
            Arc::new(move |params| {
                let handler = handler.clone();
                Box::pin(async move {
                    let request = parley_schema::from_value(params)
                        .map_err(|e| McpError::InvalidParams(e.to_string()))?;
                    let result = handler(request).await?;
                    Ok(serde_json::to_value(result)?)
                })
            }),
        );
    }

    handlers
}

fn build_notification_handlers(
    features: &ClientFeatures,
    slot: Arc<OnceLock<Weak<ClientInner>>>,
) -> HashMap<String, NotificationHandler> {
    let mut handlers: HashMap<String, NotificationHandler> = HashMap::new();

    {
        let slot = slot.clone();
        let consumers = features.tools_change_consumers.clone();
        handlers.insert(
            methods::NOTIFICATION_TOOLS_LIST_CHANGED.to_string(),
            Arc::new(move |_params| {
                let slot = slot.clone();
                let consumers = consumers.clone();
                Box::pin(async move {
                    let Some(client) = client_from(&slot) else {
                        return Ok(());
                    };
                    let result = client.list_tools(None).await?;
                    debug!(tools = result.tools.len(), "tools list changed");
                    for consumer in &consumers {
                        if let Err(e) = consumer(result.tools.clone()).await {
                            error!(error = %e, "tools change consumer failed");
                        }
                    }
                    Ok(())
                })
            }),
        );
    }

    {
        let slot = slot.clone();
        let consumers = features.resources_change_consumers.clone();
        handlers.insert(
            methods::NOTIFICATION_RESOURCES_LIST_CHANGED.to_string(),
            Arc::new(move |_params| {
                let slot = slot.clone();
                let consumers = consumers.clone();
                Box::pin(async move {
                    let Some(client) = client_from(&slot) else {
                        return Ok(());
                    };
                    let result = client.list_resources(None).await?;
                    debug!(resources = result.resources.len(), "resources list changed");
                    for consumer in &consumers {
                        if let Err(e) = consumer(result.resources.clone()).await {
                            error!(error = %e, "resources change consumer failed");
                        }
                    }
                    Ok(())
                })
            }),
        );
    }

    {
        let slot = slot.clone();
        let consumers = features.prompts_change_consumers.clone();
        handlers.insert(
            methods::NOTIFICATION_PROMPTS_LIST_CHANGED.to_string(),
            Arc::new(move |_params| {
                let slot = slot.clone();
                let consumers = consumers.clone();
                Box::pin(async move {
                    let Some(client) = client_from(&slot) else {
                        return Ok(());
                    };
                    let result = client.list_prompts(None).await?;
                    debug!(prompts = result.prompts.len(), "prompts list changed");
                    for consumer in &consumers {
                        if let Err(e) = consumer(result.prompts.clone()).await {
                            error!(error = %e, "prompts change consumer failed");
                        }
                    }
                    Ok(())
                })
            }),
        );
    }

    {
        let consumers = features.logging_consumers.clone();
        handlers.insert(
            methods::NOTIFICATION_MESSAGE.to_string(),
            Arc::new(move |params| {
                let consumers = consumers.clone();
                Box::pin(async move {
                    let notification: LoggingMessageNotification = parley_schema::from_value(
                        params,
                    )
                    .map_err(|e| McpError::InvalidParams(e.to_string()))?;
                    debug!(level = ?notification.level, "server log message");
                    for consumer in &consumers {
                        if let Err(e) = consumer(notification.clone()).await {
                            error!(error = %e, "logging consumer failed");
                        }
                    }
                    Ok(())
                })
            }),
        );
    }

    // Subscription updates have no consumer surface here; acknowledge them
    // at debug level instead of logging a missing-handler error.
    handlers.insert(
        methods::NOTIFICATION_RESOURCES_UPDATED.to_string(),
        Arc::new(move |params| {
            Box::pin(async move {
                debug!(params = ?params, "resource updated");
                Ok(())
            })
        }),
    );

    handlers
}

fn client_from(slot: &OnceLock<Weak<ClientInner>>) -> Option<McpClient> {
    slot.get()
        .and_then(Weak::upgrade)
        .map(|inner| McpClient { inner })
}
