use std::time::Duration;

use parley_runtime::DEFAULT_REQUEST_TIMEOUT;
use parley_schema::types::{ClientCapabilities, Implementation, Root};
use parley_schema::LATEST_PROTOCOL_VERSION;

/// Default wait on the readiness latch.
pub const DEFAULT_INITIALIZATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Client identity, capabilities and protocol knobs; validated once when the
/// client is built.
#[derive(Clone)]
pub struct ClientConfig {
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    /// Supported protocol revisions, preferred version last.
    pub protocol_versions: Vec<String>,
    /// Max wait per request-reply pair.
    pub request_timeout: Duration,
    /// Max wait on the readiness latch before operations fail.
    pub initialization_timeout: Duration,
    /// Roots advertised to servers from the start.
    pub roots: Vec<Root>,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            client_info: Implementation::new(name, version),
            capabilities: ClientCapabilities::default(),
            protocol_versions: vec![LATEST_PROTOCOL_VERSION.to_string()],
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            initialization_timeout: DEFAULT_INITIALIZATION_TIMEOUT,
            roots: Vec::new(),
        }
    }
}
