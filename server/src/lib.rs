//! Core MCP server runtime: metadata registry, argument coercion, the
//! per-connection session engine, and the stdio transport.
//!
//! Hosts build a [`McpServer`], register tools/resources/prompts against its
//! registry, and hand the server to one or more transports. Each transport
//! connection becomes a [`Session`] that speaks JSON-RPC 2.0 with the
//! client.

mod coerce;
mod context;
mod error;
mod metadata;
mod outgoing;
mod registry;
mod server;
mod session;
pub mod transport;
pub mod uri_template;

pub use coerce::CoercionError;
pub use coerce::coerce_arguments;
pub use context::RequestContext;
pub use error::Result;
pub use error::ServerError;
pub use metadata::MetadataError;
pub use metadata::ParameterInfo;
pub use metadata::PromptMetadata;
pub use metadata::ResourceMetadata;
pub use metadata::ToolMetadata;
pub use metadata::input_schema;
pub use registry::PromptHandler;
pub use registry::Registry;
pub use registry::RegistryError;
pub use registry::ResourceHandler;
pub use registry::ToolError;
pub use registry::ToolHandler;
pub use registry::ToolOutput;
pub use server::CompletionProvider;
pub use server::DynamicRegistry;
pub use server::McpServer;
pub use server::McpServerBuilder;
pub use session::Authorization;
pub use session::Session;
pub use session::SessionId;
pub use session::SessionState;
