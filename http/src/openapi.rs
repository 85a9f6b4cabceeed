//! Thin OpenAPI rendering of the registered tool surface. The wire contract
//! is the JSON-RPC endpoint; this document exists so HTTP-first clients can
//! discover it.

use serde_json::Value;
use serde_json::json;
use std::sync::Arc;
use toolbus_server::McpServer;
use toolbus_server::ServerError;

pub(crate) fn document(server: &Arc<McpServer>) -> Result<Value, ServerError> {
    let mut schemas = serde_json::Map::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = server.registry().list_tools(cursor.as_deref())?;
        for tool in page.tools {
            schemas.insert(tool.name.clone(), serde_json::to_value(&tool.input_schema)
                .map_err(|err| ServerError::Internal(err.to_string()))?);
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    let info = server.server_info();
    Ok(json!({
        "openapi": "3.1.0",
        "info": {
            "title": info.name,
            "version": info.version,
        },
        "paths": {
            "/messages/": {
                "post": {
                    "summary": "Submit a JSON-RPC 2.0 message to an active session",
                    "parameters": [{
                        "name": "session_id",
                        "in": "query",
                        "required": true,
                        "schema": {"type": "string"},
                    }],
                    "responses": {
                        "202": {"description": "Message accepted; the reply arrives on the SSE stream"},
                    },
                },
            },
            "/sse": {
                "get": {
                    "summary": "Open the session event stream",
                    "responses": {
                        "200": {"description": "text/event-stream"},
                    },
                },
            },
        },
        "components": {"schemas": schemas},
    }))
}

pub(crate) fn ai_plugin_manifest(server: &Arc<McpServer>) -> Value {
    let info = server.server_info();
    json!({
        "schema_version": "v1",
        "name_for_model": info.name,
        "name_for_human": info.name,
        "description_for_model": server.instructions().unwrap_or("Model Context Protocol server"),
        "description_for_human": server.instructions().unwrap_or("Model Context Protocol server"),
        "api": {
            "type": "openapi",
            "url": "/openapi.json",
        },
    })
}
