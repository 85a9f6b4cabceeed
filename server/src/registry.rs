//! The tool/resource/prompt registry: metadata plus invocation closures,
//! with URI-template resolution for resources.
//!
//! Reads take a cheap snapshot (`Arc` clone) so steady-state lookups never
//! hold a lock across handler execution; dynamic registration rebuilds the
//! inner table copy-on-write.

use crate::coerce::coerce_arguments;
use crate::coerce::coerce_uri_value;
use crate::context::RequestContext;
use crate::error::Result;
use crate::error::ServerError;
use crate::metadata::MetadataError;
use crate::metadata::PromptMetadata;
use crate::metadata::ResourceMetadata;
use crate::metadata::ToolMetadata;
use crate::uri_template::match_uri;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use indexmap::IndexMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::RwLock;
use thiserror::Error;
use toolbus_protocol::CallToolResult;
use toolbus_protocol::ContentBlock;
use toolbus_protocol::GetPromptResult;
use toolbus_protocol::JsonObject;
use toolbus_protocol::ListPromptsResult;
use toolbus_protocol::ListResourceTemplatesResult;
use toolbus_protocol::ListResourcesResult;
use toolbus_protocol::ListToolsResult;
use toolbus_protocol::ReadResourceResult;
use toolbus_protocol::ResourceContents;

const PAGE_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a tool or prompt named \"{0}\" is already registered")]
    DuplicateName(String),

    #[error("no live server is registered under \"{0}\"")]
    UnknownServer(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// A tool-reported failure. Surfaced to the client as an `isError` result
/// so the model can react, not as a JSON-RPC error.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ToolError(pub String);

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        ToolError(message.into())
    }
}

impl From<String> for ToolError {
    fn from(message: String) -> Self {
        ToolError(message)
    }
}

impl From<&str> for ToolError {
    fn from(message: &str) -> Self {
        ToolError(message.to_string())
    }
}

/// What a tool handler produces: content blocks plus optional structured
/// output mirroring the tool's return schema.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub content: Vec<ContentBlock>,
    pub structured_content: Option<Value>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        ToolOutput {
            content: vec![ContentBlock::text(text)],
            structured_content: None,
        }
    }

    /// Render a JSON value the way clients expect scalars: strings bare,
    /// everything else as compact JSON (`8`, not `"8.0"`).
    pub fn from_value(value: Value) -> Self {
        let text = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ToolOutput {
            content: vec![ContentBlock::text(text)],
            structured_content: None,
        }
    }

    pub fn with_structured(mut self, value: Value) -> Self {
        self.structured_content = Some(value);
        self
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        args: JsonObject,
        cx: RequestContext,
    ) -> std::result::Result<ToolOutput, ToolError>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(JsonObject, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<ToolOutput, ToolError>> + Send,
{
    async fn call(
        &self,
        args: JsonObject,
        cx: RequestContext,
    ) -> std::result::Result<ToolOutput, ToolError> {
        (self)(args, cx).await
    }
}

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(
        &self,
        args: JsonObject,
        cx: RequestContext,
    ) -> std::result::Result<Vec<ResourceContents>, ToolError>;
}

#[async_trait]
impl<F, Fut> ResourceHandler for F
where
    F: Fn(JsonObject, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Vec<ResourceContents>, ToolError>> + Send,
{
    async fn read(
        &self,
        args: JsonObject,
        cx: RequestContext,
    ) -> std::result::Result<Vec<ResourceContents>, ToolError> {
        (self)(args, cx).await
    }
}

#[async_trait]
pub trait PromptHandler: Send + Sync {
    async fn get(
        &self,
        args: JsonObject,
        cx: RequestContext,
    ) -> std::result::Result<GetPromptResult, ToolError>;
}

#[async_trait]
impl<F, Fut> PromptHandler for F
where
    F: Fn(JsonObject, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<GetPromptResult, ToolError>> + Send,
{
    async fn get(
        &self,
        args: JsonObject,
        cx: RequestContext,
    ) -> std::result::Result<GetPromptResult, ToolError> {
        (self)(args, cx).await
    }
}

pub(crate) struct ToolEntry {
    pub metadata: ToolMetadata,
    pub handler: Arc<dyn ToolHandler>,
}

pub(crate) struct ResourceEntry {
    pub metadata: ResourceMetadata,
    pub handler: Arc<dyn ResourceHandler>,
}

pub(crate) struct PromptEntry {
    pub metadata: PromptMetadata,
    pub handler: Arc<dyn PromptHandler>,
}

#[derive(Default)]
struct RegistryInner {
    tools: IndexMap<String, Arc<ToolEntry>>,
    resources: Vec<Arc<ResourceEntry>>,
    prompts: IndexMap<String, Arc<PromptEntry>>,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<Arc<RegistryInner>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    fn snapshot(&self) -> Arc<RegistryInner> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut RegistryInner)) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = RegistryInner {
            tools: guard.tools.clone(),
            resources: guard.resources.clone(),
            prompts: guard.prompts.clone(),
        };
        f(&mut next);
        *guard = Arc::new(next);
    }

    pub fn register_tool(
        &self,
        metadata: ToolMetadata,
        handler: Arc<dyn ToolHandler>,
    ) -> std::result::Result<(), RegistryError> {
        metadata.validate()?;
        if self.snapshot().tools.contains_key(&metadata.name) {
            return Err(RegistryError::DuplicateName(metadata.name));
        }
        tracing::debug!(tool = %metadata.name, "registering tool");
        self.update(|inner| {
            inner.tools.insert(
                metadata.name.clone(),
                Arc::new(ToolEntry { metadata, handler }),
            );
        });
        Ok(())
    }

    pub fn register_resource(
        &self,
        metadata: ResourceMetadata,
        handler: Arc<dyn ResourceHandler>,
    ) -> std::result::Result<(), RegistryError> {
        metadata.validate()?;
        tracing::debug!(resource = %metadata.name, "registering resource");
        self.update(|inner| {
            inner
                .resources
                .push(Arc::new(ResourceEntry { metadata, handler }));
        });
        Ok(())
    }

    pub fn register_prompt(
        &self,
        metadata: PromptMetadata,
        handler: Arc<dyn PromptHandler>,
    ) -> std::result::Result<(), RegistryError> {
        if self.snapshot().prompts.contains_key(&metadata.name) {
            return Err(RegistryError::DuplicateName(metadata.name));
        }
        tracing::debug!(prompt = %metadata.name, "registering prompt");
        self.update(|inner| {
            inner.prompts.insert(
                metadata.name.clone(),
                Arc::new(PromptEntry { metadata, handler }),
            );
        });
        Ok(())
    }

    pub fn has_tools(&self) -> bool {
        !self.snapshot().tools.is_empty()
    }

    pub fn has_resources(&self) -> bool {
        !self.snapshot().resources.is_empty()
    }

    pub fn has_prompts(&self) -> bool {
        !self.snapshot().prompts.is_empty()
    }

    pub fn list_tools(&self, cursor: Option<&str>) -> Result<ListToolsResult> {
        let snapshot = self.snapshot();
        let all: Vec<_> = snapshot.tools.values().map(|e| e.metadata.to_tool()).collect();
        let (page, next_cursor) = paginate(all, cursor)?;
        Ok(ListToolsResult {
            tools: page,
            next_cursor,
        })
    }

    pub fn list_resources(&self, cursor: Option<&str>) -> Result<ListResourcesResult> {
        let snapshot = self.snapshot();
        let all: Vec<_> = snapshot
            .resources
            .iter()
            .flat_map(|e| e.metadata.concrete_resources())
            .collect();
        let (page, next_cursor) = paginate(all, cursor)?;
        Ok(ListResourcesResult {
            resources: page,
            next_cursor,
        })
    }

    pub fn list_resource_templates(
        &self,
        cursor: Option<&str>,
    ) -> Result<ListResourceTemplatesResult> {
        let snapshot = self.snapshot();
        let all: Vec<_> = snapshot
            .resources
            .iter()
            .flat_map(|e| e.metadata.templates())
            .collect();
        let (page, next_cursor) = paginate(all, cursor)?;
        Ok(ListResourceTemplatesResult {
            resource_templates: page,
            next_cursor,
        })
    }

    pub fn list_prompts(&self, cursor: Option<&str>) -> Result<ListPromptsResult> {
        let snapshot = self.snapshot();
        let all: Vec<_> = snapshot
            .prompts
            .values()
            .map(|e| e.metadata.to_prompt())
            .collect();
        let (page, next_cursor) = paginate(all, cursor)?;
        Ok(ListPromptsResult {
            prompts: page,
            next_cursor,
        })
    }

    /// Try every registered template; the match binding the most variables
    /// wins, earliest registration breaking ties.
    pub(crate) fn resolve_resource(&self, uri: &str) -> Option<(Arc<ResourceEntry>, JsonObject)> {
        let snapshot = self.snapshot();
        let mut best: Option<(Arc<ResourceEntry>, JsonObject)> = None;
        for entry in &snapshot.resources {
            for template in &entry.metadata.uri_templates {
                if let Some(vars) = match_uri(template, uri) {
                    let better = match &best {
                        Some((_, existing)) => vars.len() > existing.len(),
                        None => true,
                    };
                    if better {
                        best = Some((Arc::clone(entry), vars));
                    }
                }
            }
        }
        best
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        cx: RequestContext,
    ) -> Result<CallToolResult> {
        let entry = self
            .snapshot()
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| ServerError::UnknownTool(name.to_string()))?;

        let args = coerce_arguments(&entry.metadata.parameters, &arguments.unwrap_or_default())?;

        let handler = Arc::clone(&entry.handler);
        let outcome = tokio::spawn(async move { handler.call(args, cx).await }).await;
        match outcome {
            Ok(Ok(output)) => Ok(CallToolResult {
                content: output.content,
                is_error: None,
                structured_content: output.structured_content,
            }),
            Ok(Err(tool_err)) => Ok(CallToolResult {
                content: vec![ContentBlock::text(tool_err.to_string())],
                is_error: Some(true),
                structured_content: None,
            }),
            Err(join_err) if join_err.is_panic() => {
                tracing::error!(tool = name, "tool handler panicked");
                Err(ServerError::Internal(format!("tool \"{name}\" panicked")))
            }
            Err(_) => Err(ServerError::Internal(format!(
                "tool \"{name}\" was cancelled"
            ))),
        }
    }

    pub async fn read_resource(&self, uri: &str, cx: RequestContext) -> Result<ReadResourceResult> {
        let (entry, vars) = self
            .resolve_resource(uri)
            .ok_or_else(|| ServerError::UnknownResource(uri.to_string()))?;

        let mut args = JsonObject::new();
        for param in &entry.metadata.parameters {
            match vars.get(&param.name).and_then(Value::as_str) {
                Some(raw) => {
                    args.insert(
                        param.name.clone(),
                        coerce_uri_value(&param.name, &param.schema, raw)?,
                    );
                }
                None => match &param.default_value {
                    Some(default) => {
                        args.insert(param.name.clone(), default.clone());
                    }
                    None if param.required => {
                        return Err(ServerError::UnknownResource(uri.to_string()));
                    }
                    None => {}
                },
            }
        }

        let handler = Arc::clone(&entry.handler);
        let outcome = tokio::spawn(async move { handler.read(args, cx).await }).await;
        let contents = match outcome {
            Ok(Ok(contents)) => contents,
            Ok(Err(err)) => return Err(ServerError::ToolFailure(err.to_string())),
            Err(join_err) if join_err.is_panic() => {
                tracing::error!(uri, "resource handler panicked");
                return Err(ServerError::Internal(format!(
                    "resource handler for \"{uri}\" panicked"
                )));
            }
            Err(_) => {
                return Err(ServerError::Internal(format!(
                    "resource read for \"{uri}\" was cancelled"
                )));
            }
        };

        // Fill in addressing the handler left implicit.
        let contents = contents
            .into_iter()
            .map(|mut c| {
                if c.uri.is_empty() {
                    c.uri = uri.to_string();
                }
                if c.mime_type.is_none() {
                    c.mime_type = entry.metadata.mime_type.clone();
                }
                c
            })
            .collect();
        Ok(ReadResourceResult { contents })
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        cx: RequestContext,
    ) -> Result<GetPromptResult> {
        let entry = self
            .snapshot()
            .prompts
            .get(name)
            .cloned()
            .ok_or_else(|| ServerError::UnknownPrompt(name.to_string()))?;

        let args = coerce_arguments(&entry.metadata.arguments, &arguments.unwrap_or_default())?;

        let handler = Arc::clone(&entry.handler);
        let outcome = tokio::spawn(async move { handler.get(args, cx).await }).await;
        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(ServerError::ToolFailure(err.to_string())),
            Err(join_err) if join_err.is_panic() => {
                tracing::error!(prompt = name, "prompt handler panicked");
                Err(ServerError::Internal(format!("prompt \"{name}\" panicked")))
            }
            Err(_) => Err(ServerError::Internal(format!(
                "prompt \"{name}\" was cancelled"
            ))),
        }
    }
}

fn paginate<T>(all: Vec<T>, cursor: Option<&str>) -> Result<(Vec<T>, Option<String>)> {
    let start = match cursor {
        Some(cursor) => decode_cursor(cursor).ok_or_else(|| ServerError::InvalidParams {
            message: format!("malformed cursor: {cursor}"),
            data: None,
        })?,
        None => 0,
    };
    let end = (start + PAGE_SIZE).min(all.len());
    let next = (end < all.len()).then(|| encode_cursor(end));
    let page = all
        .into_iter()
        .skip(start)
        .take(PAGE_SIZE)
        .collect();
    Ok((page, next))
}

fn encode_cursor(index: usize) -> String {
    URL_SAFE_NO_PAD.encode(index.to_string())
}

fn decode_cursor(cursor: &str) -> Option<usize> {
    let bytes = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    String::from_utf8(bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ParameterInfo;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use toolbus_protocol::JsonSchema;

    fn noop_resource() -> Arc<dyn ResourceHandler> {
        Arc::new(|_args: JsonObject, _cx: RequestContext| async move {
            Ok(vec![ResourceContents::text("", "ok")])
        })
    }

    #[test]
    fn duplicate_tool_names_are_rejected() {
        let registry = Registry::new();
        let handler: Arc<dyn ToolHandler> = Arc::new(|_args: JsonObject, _cx: RequestContext| {
            async move { Ok(ToolOutput::text("hi")) }
        });
        registry
            .register_tool(ToolMetadata::new("echo"), Arc::clone(&handler))
            .expect("first registration succeeds");
        let err = registry
            .register_tool(ToolMetadata::new("echo"), handler)
            .expect_err("duplicate must fail");
        assert!(matches!(err, RegistryError::DuplicateName(name) if name == "echo"));
    }

    #[test]
    fn most_specific_template_wins_and_order_breaks_ties() {
        let registry = Registry::new();
        registry
            .register_resource(
                ResourceMetadata::new("pinned", vec!["app://docs/{name}/latest".into()])
                    .with_parameter(ParameterInfo::required("name", JsonSchema::string())),
                noop_resource(),
            )
            .expect("register");
        registry
            .register_resource(
                ResourceMetadata::new("versioned", vec!["app://docs/{name}/{rev}".into()])
                    .with_parameter(ParameterInfo::required("name", JsonSchema::string()))
                    .with_parameter(ParameterInfo::required("rev", JsonSchema::string())),
                noop_resource(),
            )
            .expect("register");

        // Both templates match; the one binding more variables wins.
        let (entry, vars) = registry
            .resolve_resource("app://docs/handbook/latest")
            .expect("must resolve");
        assert_eq!(entry.metadata.name, "versioned");
        assert_eq!(vars.get("name"), Some(&json!("handbook")));
        assert_eq!(vars.get("rev"), Some(&json!("latest")));

        registry
            .register_resource(
                ResourceMetadata::new("first", vec!["app://logs/{day}/tail".into()])
                    .with_parameter(ParameterInfo::required("day", JsonSchema::string())),
                noop_resource(),
            )
            .expect("register");
        registry
            .register_resource(
                ResourceMetadata::new("second", vec!["app://logs/{date}/tail".into()])
                    .with_parameter(ParameterInfo::required("date", JsonSchema::string())),
                noop_resource(),
            )
            .expect("register");

        // Equal variable counts: first registration wins.
        let (entry, vars) = registry
            .resolve_resource("app://logs/today/tail")
            .expect("must resolve");
        assert_eq!(entry.metadata.name, "first");
        assert_eq!(vars.get("day"), Some(&json!("today")));
    }

    #[test]
    fn pagination_walks_the_whole_list() {
        let registry = Registry::new();
        for i in 0..120 {
            let handler: Arc<dyn ToolHandler> =
                Arc::new(|_args: JsonObject, _cx: RequestContext| {
                    async move { Ok(ToolOutput::text("")) }
                });
            registry
                .register_tool(ToolMetadata::new(format!("tool-{i:03}")), handler)
                .expect("register");
        }

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = registry
                .list_tools(cursor.as_deref())
                .expect("list should succeed");
            seen.extend(page.tools.into_iter().map(|t| t.name));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 120);
        assert_eq!(seen.first().map(String::as_str), Some("tool-000"));
        assert_eq!(seen.last().map(String::as_str), Some("tool-119"));
    }

    #[test]
    fn malformed_cursor_is_invalid_params() {
        let registry = Registry::new();
        let err = registry
            .list_tools(Some("!!not-base64!!"))
            .expect_err("must fail");
        assert_eq!(err.json_rpc_code(), -32602);
    }
}
