//! The host-facing server object: aggregates the registry, reports
//! name/version/capabilities, mints sessions for transports, and fans
//! notifications out to attached sessions.

use crate::error::Result;
use crate::metadata::PromptMetadata;
use crate::metadata::ResourceMetadata;
use crate::metadata::ToolMetadata;
use crate::registry::PromptHandler;
use crate::registry::Registry;
use crate::registry::RegistryError;
use crate::registry::ResourceHandler;
use crate::registry::ToolHandler;
use crate::session::Session;
use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::Weak;
use tokio::sync::mpsc;
use toolbus_protocol::CompletionArgument;
use toolbus_protocol::CompletionReference;
use toolbus_protocol::CompletionValues;
use toolbus_protocol::Implementation;
use toolbus_protocol::JsonRpcMessage;
use toolbus_protocol::LoggingCapability;
use toolbus_protocol::LoggingLevel;
use toolbus_protocol::PromptsCapability;
use toolbus_protocol::ResourcesCapability;
use toolbus_protocol::ServerCapabilities;
use toolbus_protocol::ToolsCapability;

/// Hook for `completion/complete`. Servers without one answer with an empty
/// value list.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        reference: CompletionReference,
        argument: CompletionArgument,
    ) -> Result<CompletionValues>;
}

pub struct McpServerBuilder {
    name: String,
    version: String,
    instructions: Option<String>,
    completion: Option<Arc<dyn CompletionProvider>>,
}

impl McpServerBuilder {
    pub fn instructions(mut self, text: impl Into<String>) -> Self {
        self.instructions = Some(text.into());
        self
    }

    pub fn completion_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.completion = Some(provider);
        self
    }

    pub fn build(self) -> Arc<McpServer> {
        let server = Arc::new(McpServer {
            name: self.name,
            version: self.version,
            instructions: self.instructions,
            completion: self.completion,
            registry: Registry::new(),
            sessions: Mutex::new(Vec::new()),
        });
        dynamic_registry().register(&server);
        server
    }
}

pub struct McpServer {
    name: String,
    version: String,
    instructions: Option<String>,
    completion: Option<Arc<dyn CompletionProvider>>,
    registry: Registry,
    sessions: Mutex<Vec<Weak<Session>>>,
}

impl McpServer {
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> McpServerBuilder {
        McpServerBuilder {
            name: name.into(),
            version: version.into(),
            instructions: None,
            completion: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn server_info(&self) -> Implementation {
        Implementation {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    pub(crate) fn completion_provider(&self) -> Option<Arc<dyn CompletionProvider>> {
        self.completion.clone()
    }

    /// Capabilities are synthesized from what is actually registered: a
    /// server with no resources does not advertise the resource surface.
    pub fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            experimental: None,
            logging: Some(LoggingCapability { enabled: true }),
            completions: self.completion.as_ref().map(|_| json!({})),
            prompts: self.registry.has_prompts().then_some(PromptsCapability {
                list_changed: Some(true),
            }),
            resources: self.registry.has_resources().then_some(ResourcesCapability {
                subscribe: Some(true),
                list_changed: Some(true),
            }),
            tools: self.registry.has_tools().then_some(ToolsCapability {
                list_changed: Some(true),
            }),
        }
    }

    /// Bind a new session to a transport sink. Called once per client
    /// connection; the transport feeds inbound frames to the returned
    /// session and drains `outgoing` to the wire.
    pub fn connect(self: &Arc<Self>, outgoing: mpsc::UnboundedSender<JsonRpcMessage>) -> Arc<Session> {
        let session = Session::spawn(Arc::clone(self), outgoing);
        self.lock_sessions().push(Arc::downgrade(&session));
        session
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, Vec<Weak<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live sessions, pruning entries whose transport has gone away.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut guard = self.lock_sessions();
        guard.retain(|weak| weak.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn register_tool(
        &self,
        metadata: ToolMetadata,
        handler: Arc<dyn ToolHandler>,
    ) -> std::result::Result<(), RegistryError> {
        self.registry.register_tool(metadata, handler)?;
        for session in self.sessions() {
            session.notify_tools_list_changed();
        }
        Ok(())
    }

    pub fn register_resource(
        &self,
        metadata: ResourceMetadata,
        handler: Arc<dyn ResourceHandler>,
    ) -> std::result::Result<(), RegistryError> {
        self.registry.register_resource(metadata, handler)?;
        for session in self.sessions() {
            session.notify_resources_list_changed();
        }
        Ok(())
    }

    pub fn register_prompt(
        &self,
        metadata: PromptMetadata,
        handler: Arc<dyn PromptHandler>,
    ) -> std::result::Result<(), RegistryError> {
        self.registry.register_prompt(metadata, handler)?;
        for session in self.sessions() {
            session.notify_prompts_list_changed();
        }
        Ok(())
    }

    /// Tell subscribed sessions that a resource changed.
    pub fn notify_resource_updated(&self, uri: &str) {
        for session in self.sessions() {
            session.notify_resource_updated(uri);
        }
    }

    /// Send a log notification to every attached session, each applying its
    /// own level filter.
    pub fn broadcast_log(&self, level: LoggingLevel, logger: Option<String>, data: Value) {
        for session in self.sessions() {
            session.send_log_message(level, logger.clone(), data.clone());
        }
    }
}

/// Process-wide registry of live servers, keyed by server name. Lets code
/// far from the server handle add tools after startup; the affected server
/// notifies its sessions as usual.
pub struct DynamicRegistry {
    servers: Mutex<HashMap<String, Weak<McpServer>>>,
}

fn dynamic_registry() -> &'static DynamicRegistry {
    static REGISTRY: OnceLock<DynamicRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| DynamicRegistry {
        servers: Mutex::new(HashMap::new()),
    })
}

impl DynamicRegistry {
    pub fn global() -> &'static DynamicRegistry {
        dynamic_registry()
    }

    fn register(&self, server: &Arc<McpServer>) {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server.name.clone(), Arc::downgrade(server));
    }

    fn find(&self, server_name: &str) -> Option<Arc<McpServer>> {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_name)
            .and_then(Weak::upgrade)
    }

    pub fn register_tool(
        &self,
        server_name: &str,
        metadata: ToolMetadata,
        handler: Arc<dyn ToolHandler>,
    ) -> std::result::Result<(), RegistryError> {
        let Some(server) = self.find(server_name) else {
            return Err(RegistryError::UnknownServer(server_name.to_string()));
        };
        server.register_tool(metadata, handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ToolOutput;
    use pretty_assertions::assert_eq;
    use toolbus_protocol::JsonObject;

    fn echo_handler() -> Arc<dyn ToolHandler> {
        Arc::new(|args: JsonObject, _cx: crate::context::RequestContext| async move {
            Ok(ToolOutput::from_value(Value::Object(args)))
        })
    }

    #[tokio::test]
    async fn capabilities_track_registry_contents() {
        let server = McpServer::builder("caps-test", "0.0.1").build();
        let caps = server.capabilities();
        assert_eq!(caps.tools, None);
        assert_eq!(caps.resources, None);
        assert!(caps.logging.is_some());

        server
            .register_tool(ToolMetadata::new("echo"), echo_handler())
            .expect("register");
        let caps = server.capabilities();
        assert_eq!(
            caps.tools,
            Some(ToolsCapability {
                list_changed: Some(true)
            })
        );
    }

    #[tokio::test]
    async fn dynamic_registration_reaches_a_live_server() {
        let server = McpServer::builder("dynamic-test", "0.0.1").build();
        DynamicRegistry::global()
            .register_tool("dynamic-test", ToolMetadata::new("late"), echo_handler())
            .expect("dynamic registration should succeed");
        assert!(server.registry().has_tools());

        let missing = DynamicRegistry::global().register_tool(
            "no-such-server",
            ToolMetadata::new("late"),
            echo_handler(),
        );
        assert!(missing.is_err());
    }
}
