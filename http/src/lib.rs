//! HTTP+SSE transport.
//!
//! A client opens `GET /sse` and receives an `endpoint` event naming the
//! message URL for its freshly minted session, then POSTs JSON-RPC frames to
//! `POST /messages/?session_id=…`. Responses and server-initiated traffic
//! flow back over the SSE stream, never in the POST body.

mod auth;
mod openapi;
mod proxy;
mod routes;

use axum::Router;
use axum::routing::get;
use axum::routing::post;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use toolbus_auth::OAuthConfiguration;
use toolbus_server::McpServer;
use toolbus_server::Session;
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Error, Debug)]
pub enum HttpTransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct HttpTransportConfig {
    pub bind_addr: SocketAddr,
    /// Serve `GET /openapi.json` and `/.well-known/ai-plugin.json`.
    pub serve_openapi: bool,
    /// Static bearer token; checked only when no OAuth configuration is
    /// installed.
    pub bearer_token: Option<String>,
    pub oauth: Option<Arc<OAuthConfiguration>>,
    /// Scopes a validated token must carry; anything missing is a 403.
    pub required_scopes: Vec<String>,
    /// SSE keepalive comment interval.
    pub keepalive: Duration,
}

impl HttpTransportConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        HttpTransportConfig {
            bind_addr,
            serve_openapi: false,
            bearer_token: None,
            oauth: None,
            required_scopes: Vec::new(),
            keepalive: Duration::from_secs(15),
        }
    }

    pub fn with_openapi(mut self) -> Self {
        self.serve_openapi = true;
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_oauth(mut self, oauth: Arc<OAuthConfiguration>) -> Self {
        self.oauth = Some(oauth);
        self
    }

    pub fn with_required_scope(mut self, scope: impl Into<String>) -> Self {
        self.required_scopes.push(scope.into());
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }
}

pub(crate) struct AppState {
    pub(crate) server: Arc<McpServer>,
    pub(crate) sessions: RwLock<HashMap<String, Arc<Session>>>,
    pub(crate) config: HttpTransportConfig,
}

/// Build the transport's router. Exposed so hosts can mount it inside a
/// larger application; most callers want [`serve`].
pub fn app(server: Arc<McpServer>, config: HttpTransportConfig) -> Router {
    let transparent_proxy = config
        .oauth
        .as_ref()
        .is_some_and(|oauth| oauth.transparent_proxy);
    let serve_openapi = config.serve_openapi;

    let state = Arc::new(AppState {
        server,
        sessions: RwLock::new(HashMap::new()),
        config,
    });

    let mut router = Router::new()
        .route("/sse", get(routes::sse))
        .route("/messages", post(routes::post_message))
        .route("/messages/", post(routes::post_message));

    if serve_openapi {
        router = router
            .route("/openapi.json", get(routes::openapi_document))
            .route("/.well-known/ai-plugin.json", get(routes::ai_plugin));
    }
    if transparent_proxy {
        router = router
            .route("/.well-known/oauth-authorization-server", get(proxy::metadata))
            .route("/.well-known/openid-configuration", get(proxy::metadata))
            .route("/authorize", get(proxy::authorize))
            .route("/token", post(proxy::token))
            .route("/introspect", post(proxy::introspect))
            .route("/register", post(proxy::register));
    }

    router.layer(CorsLayer::permissive()).with_state(state)
}

/// Bind the configured address and serve until the process exits.
pub async fn serve(
    server: Arc<McpServer>,
    config: HttpTransportConfig,
) -> Result<(), HttpTransportError> {
    let addr = config.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| HttpTransportError::Bind { addr, source })?;
    serve_on(listener, server, config).await
}

/// Serve on an already-bound listener; useful for ephemeral ports.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    server: Arc<McpServer>,
    config: HttpTransportConfig,
) -> Result<(), HttpTransportError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP+SSE transport listening");
    }
    let router = app(server, config);
    axum::serve(listener, router).await?;
    Ok(())
}
