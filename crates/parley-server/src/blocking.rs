//! Thin synchronous wrapper over the async server. Owns its runtime and
//! blocks on the async core; no logic is duplicated here.

use std::sync::Arc;

use parley_runtime::McpError;
use parley_schema::types::CompleteReference;

use crate::{
    CompletionSpec, McpServer, PromptSpec, ResourceSpec, ServerConfig, ServerFeatures,
    ServerTransportProvider, ToolSpec,
};

pub struct BlockingMcpServer {
    runtime: tokio::runtime::Runtime,
    inner: McpServer,
}

impl BlockingMcpServer {
    pub fn new(
        provider: Arc<dyn ServerTransportProvider>,
        config: ServerConfig,
        features: ServerFeatures,
    ) -> Result<Self, McpError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| McpError::Internal(format!("failed to start runtime: {e}")))?;
        let inner = {
            let _guard = runtime.enter();
            McpServer::new(provider, config, features)?
        };
        Ok(Self { runtime, inner })
    }

    pub fn add_tool(&self, spec: ToolSpec) -> Result<(), McpError> {
        self.runtime.block_on(self.inner.add_tool(spec))
    }

    pub fn remove_tool(&self, name: &str) -> Result<(), McpError> {
        self.runtime.block_on(self.inner.remove_tool(name))
    }

    pub fn add_resource(&self, spec: ResourceSpec) -> Result<(), McpError> {
        self.runtime.block_on(self.inner.add_resource(spec))
    }

    pub fn remove_resource(&self, uri: &str) -> Result<(), McpError> {
        self.runtime.block_on(self.inner.remove_resource(uri))
    }

    pub fn add_prompt(&self, spec: PromptSpec) -> Result<(), McpError> {
        self.runtime.block_on(self.inner.add_prompt(spec))
    }

    pub fn remove_prompt(&self, name: &str) -> Result<(), McpError> {
        self.runtime.block_on(self.inner.remove_prompt(name))
    }

    pub fn add_completion(&self, spec: CompletionSpec) -> Result<(), McpError> {
        self.inner.add_completion(spec)
    }

    pub fn remove_completion(&self, reference: &CompleteReference) -> Result<(), McpError> {
        self.inner.remove_completion(reference)
    }

    pub fn notify_tools_list_changed(&self) {
        self.runtime.block_on(self.inner.notify_tools_list_changed());
    }

    pub fn notify_resources_list_changed(&self) {
        self.runtime
            .block_on(self.inner.notify_resources_list_changed());
    }

    pub fn notify_prompts_list_changed(&self) {
        self.runtime
            .block_on(self.inner.notify_prompts_list_changed());
    }

    pub fn close_gracefully(&self) {
        self.runtime.block_on(self.inner.close_gracefully());
    }

    pub fn close(&self) {
        self.inner.close();
    }

    /// Access the async server, e.g. to hand it to async infrastructure.
    pub fn get(&self) -> &McpServer {
        &self.inner
    }
}
