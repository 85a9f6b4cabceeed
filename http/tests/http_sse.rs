//! Integration tests over a bound port: the test drives the transport the
//! way a real client would, with JSON-RPC POSTs answered over the SSE
//! stream.

use async_trait::async_trait;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use toolbus_auth::AuthError;
use toolbus_auth::AuthorizationContext;
use toolbus_auth::OAuthConfiguration;
use toolbus_auth::TokenValidating;
use toolbus_auth::TokenValidationMode;
use toolbus_http::HttpTransportConfig;
use toolbus_protocol::JsonObject;
use toolbus_protocol::JsonSchema;
use toolbus_server::McpServer;
use toolbus_server::ParameterInfo;
use toolbus_server::RequestContext;
use toolbus_server::ToolMetadata;
use toolbus_server::ToolOutput;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn add_server() -> Arc<McpServer> {
    let server = McpServer::builder("http-test", "1.0.0").build();
    server
        .register_tool(
            ToolMetadata::new("add")
                .with_parameter(ParameterInfo::required("a", JsonSchema::number()))
                .with_parameter(ParameterInfo::required("b", JsonSchema::number())),
            Arc::new(|args: JsonObject, _cx: RequestContext| async move {
                let a = args.get("a").and_then(Value::as_f64).unwrap_or_default();
                let b = args.get("b").and_then(Value::as_f64).unwrap_or_default();
                Ok(ToolOutput::from_value(json!((a + b) as i64)))
            }),
        )
        .expect("register add");
    server
}

async fn start(server: Arc<McpServer>, config: impl FnOnce(HttpTransportConfig) -> HttpTransportConfig) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let config = config(HttpTransportConfig::new(addr));
    tokio::spawn(async move {
        let _ = toolbus_http::serve_on(listener, server, config).await;
    });
    addr
}

/// Incremental parser over the `text/event-stream` body.
struct SseReader {
    stream: Pin<Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    buffer: String,
}

impl SseReader {
    async fn open(url: &str) -> Self {
        let response = reqwest::get(url).await.expect("open SSE stream");
        assert_eq!(response.status(), 200);
        SseReader {
            stream: Box::pin(response.bytes_stream()),
            buffer: String::new(),
        }
    }

    /// Next `(event, data)` pair, skipping keepalive comments.
    async fn next_event(&mut self) -> (String, String) {
        loop {
            if let Some(boundary) = self.buffer.find("\n\n") {
                let raw: String = self.buffer.drain(..boundary + 2).collect();
                let mut event = String::new();
                let mut data = String::new();
                for line in raw.lines() {
                    if let Some(rest) = line.strip_prefix("event:") {
                        event = rest.trim().to_string();
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        data.push_str(rest.trim());
                    }
                }
                if event.is_empty() && data.is_empty() {
                    continue;
                }
                return (event, data);
            }
            let chunk = tokio::time::timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for SSE data")
                .expect("SSE stream ended")
                .expect("SSE stream errored");
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    async fn next_message(&mut self) -> Value {
        let (event, data) = self.next_event().await;
        assert_eq!(event, "message");
        serde_json::from_str(&data).expect("SSE data is JSON")
    }
}

struct Client {
    base: String,
    sse: SseReader,
    message_url: String,
    http: reqwest::Client,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let base = format!("http://{addr}");
        let mut sse = SseReader::open(&format!("{base}/sse")).await;
        let (event, endpoint) = sse.next_event().await;
        assert_eq!(event, "endpoint");
        assert!(endpoint.starts_with("/messages/?session_id="));
        Client {
            message_url: format!("{base}{endpoint}"),
            base,
            sse,
            http: reqwest::Client::new(),
        }
    }

    async fn post(&self, body: Value) -> reqwest::StatusCode {
        self.http
            .post(&self.message_url)
            .json(&body)
            .send()
            .await
            .expect("POST message")
            .status()
    }

    async fn request(&mut self, id: i64, method: &str, params: Value) -> Value {
        let status = self
            .post(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        assert_eq!(status, 202);
        let reply = self.sse.next_message().await;
        assert_eq!(reply["id"], json!(id));
        reply
    }

    async fn initialize(&mut self) {
        let reply = self
            .request(
                1,
                "initialize",
                json!({
                    "capabilities": {},
                    "clientInfo": {"name": "sse-client", "version": "0"},
                    "protocolVersion": "2024-11-05",
                }),
            )
            .await;
        assert_eq!(reply["result"]["protocolVersion"], json!("2024-11-05"));

        let status = self
            .post(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        assert_eq!(status, 202);
    }
}

#[tokio::test]
async fn sse_handshake_and_tool_call_round_trip() {
    let addr = start(add_server(), |c| c).await;
    let mut client = Client::connect(addr).await;
    client.initialize().await;

    let reply = client.request(2, "tools/list", json!({})).await;
    assert_eq!(reply["result"]["tools"][0]["name"], json!("add"));

    let reply = client
        .request(3, "tools/call", json!({"name": "add", "arguments": {"a": 5, "b": 3}}))
        .await;
    assert_eq!(
        reply["result"]["content"],
        json!([{"type": "text", "text": "8"}])
    );
}

#[tokio::test]
async fn unknown_session_is_a_404() {
    let addr = start(add_server(), |c| c).await;
    let status = reqwest::Client::new()
        .post(format!("http://{addr}/messages/?session_id=nope"))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .expect("POST")
        .status();
    assert_eq!(status, 404);
}

#[tokio::test]
async fn malformed_body_is_a_400() {
    let addr = start(add_server(), |c| c).await;
    let client = Client::connect(addr).await;
    let status = client
        .http
        .post(&client.message_url)
        .body("this is not json")
        .send()
        .await
        .expect("POST")
        .status();
    assert_eq!(status, 400);
}

#[tokio::test]
async fn static_bearer_token_gates_every_endpoint() {
    let addr = start(add_server(), |c| c.with_bearer_token("sekrit")).await;
    let http = reqwest::Client::new();

    // No token on the SSE endpoint.
    let response = http
        .get(format!("http://{addr}/sse"))
        .send()
        .await
        .expect("GET /sse");
    assert_eq!(response.status(), 401);
    assert_eq!(
        response
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok()),
        Some("Bearer")
    );
    let body: Value = response.json().await.expect("401 body");
    assert_eq!(body, json!({"error": "invalid_token"}));

    // Wrong token on the message endpoint.
    let status = http
        .post(format!("http://{addr}/messages/?session_id=whatever"))
        .header("Authorization", "Bearer wrong")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .expect("POST")
        .status();
    assert_eq!(status, 401);

    // The right token gets through to the 404 (session really is unknown).
    let status = http
        .post(format!("http://{addr}/messages/?session_id=whatever"))
        .header("Authorization", "Bearer sekrit")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .expect("POST")
        .status();
    assert_eq!(status, 404);
}

#[tokio::test]
async fn cors_preflight_is_permissive() {
    let addr = start(add_server(), |c| c.with_bearer_token("sekrit")).await;
    let response = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, format!("http://{addr}/messages/"))
        .header("Origin", "https://inspector.example")
        .header("Access-Control-Request-Method", "POST")
        .send()
        .await
        .expect("preflight");
    assert!(response.status().is_success());
    assert!(response.headers().contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn openapi_surface_is_served_when_enabled() {
    let addr = start(add_server(), HttpTransportConfig::with_openapi).await;
    let document: Value = reqwest::get(format!("http://{addr}/openapi.json"))
        .await
        .expect("GET openapi")
        .json()
        .await
        .expect("openapi json");
    assert_eq!(document["info"]["title"], json!("http-test"));
    assert_eq!(
        document["components"]["schemas"]["add"]["type"],
        json!("object")
    );

    let manifest: Value = reqwest::get(format!("http://{addr}/.well-known/ai-plugin.json"))
        .await
        .expect("GET manifest")
        .json()
        .await
        .expect("manifest json");
    assert_eq!(manifest["api"]["url"], json!("/openapi.json"));
}

struct AcceptAll;

#[async_trait]
impl TokenValidating for AcceptAll {
    async fn validate(&self, token: &str) -> Result<AuthorizationContext, AuthError> {
        if token == "good" {
            Ok(AuthorizationContext {
                subject: Some("tester".into()),
                scopes: vec!["mcp".into()],
                claims: serde_json::Map::new(),
            })
        } else {
            Err(AuthError::InvalidSignature)
        }
    }
}

#[tokio::test]
async fn oauth_validator_gates_and_challenges_with_the_issuer() {
    let oauth = Arc::new(
        OAuthConfiguration::new("https://issuer.example")
            .with_validation(TokenValidationMode::Custom(Arc::new(AcceptAll))),
    );
    let addr = start(add_server(), move |c| c.with_oauth(oauth)).await;
    let http = reqwest::Client::new();

    let response = http
        .get(format!("http://{addr}/sse"))
        .header("Authorization", "Bearer bad")
        .send()
        .await
        .expect("GET /sse");
    assert_eq!(response.status(), 401);
    let challenge = response
        .headers()
        .get("www-authenticate")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(challenge.contains("resource_metadata=\"https://issuer.example\""));
}

#[tokio::test]
async fn transparent_proxy_rewrites_metadata_and_forwards_token_requests() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": upstream.uri(),
            "authorization_endpoint": format!("{}/authorize", upstream.uri()),
            "token_endpoint": format!("{}/token", upstream.uri()),
            "jwks_uri": format!("{}/jwks", upstream.uri()),
        })))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "minted",
            "token_type": "Bearer",
        })))
        .mount(&upstream)
        .await;

    let oauth = Arc::new(
        OAuthConfiguration::new(upstream.uri())
            .with_validation(TokenValidationMode::Custom(Arc::new(AcceptAll)))
            .with_transparent_proxy(),
    );
    let addr = start(add_server(), move |c| c.with_oauth(oauth)).await;

    let metadata: Value = reqwest::get(format!("http://{addr}/.well-known/openid-configuration"))
        .await
        .expect("GET metadata")
        .json()
        .await
        .expect("metadata json");
    assert_eq!(metadata["issuer"], json!(format!("http://{addr}")));
    assert_eq!(
        metadata["token_endpoint"],
        json!(format!("http://{addr}/token"))
    );
    // Keys are not proxied.
    assert_eq!(metadata["jwks_uri"], json!(format!("{}/jwks", upstream.uri())));

    let minted: Value = reqwest::Client::new()
        .post(format!("http://{addr}/token"))
        .form(&[("grant_type", "authorization_code"), ("code", "abc")])
        .send()
        .await
        .expect("POST /token")
        .json()
        .await
        .expect("token json");
    assert_eq!(minted["access_token"], json!("minted"));
}
