//! Transparent OAuth proxy: the upstream issuer's discovery document is
//! republished with its endpoints rewritten to this origin, and the
//! authorize/token/introspect/register endpoints forward upstream.

use crate::AppState;
use axum::Json;
use axum::body::Bytes;
use axum::extract::RawQuery;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Redirect;
use axum::response::Response;
use serde_json::json;
use std::sync::Arc;
use toolbus_auth::AuthError;
use toolbus_auth::OAuthConfiguration;
use toolbus_auth::ProviderMetadata;
use tracing::debug;

fn oauth(state: &AppState) -> Option<&Arc<OAuthConfiguration>> {
    state.config.oauth.as_ref()
}

fn bad_gateway(err: AuthError) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}

/// `http(s)://host` as seen by the client, for endpoint rewriting.
fn local_origin(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

pub(crate) async fn metadata(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let Some(oauth) = oauth(&state) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let upstream = match oauth.provider_metadata().await {
        Ok(metadata) => metadata.clone(),
        Err(err) => return bad_gateway(err),
    };

    let origin = local_origin(&headers);
    let rewritten = ProviderMetadata {
        issuer: origin.clone(),
        authorization_endpoint: Some(format!("{origin}/authorize")),
        token_endpoint: Some(format!("{origin}/token")),
        introspection_endpoint: Some(format!("{origin}/introspect")),
        registration_endpoint: Some(format!("{origin}/register")),
        // Keys stay with the upstream; clients fetch them directly.
        jwks_uri: upstream.jwks_uri,
        extra: upstream.extra,
    };
    Json(rewritten).into_response()
}

pub(crate) async fn authorize(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Response {
    let Some(oauth) = oauth(&state) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let upstream = match oauth.authorization_endpoint().await {
        Ok(endpoint) => endpoint,
        Err(err) => return bad_gateway(err),
    };
    let target = match query {
        Some(query) => format!("{upstream}?{query}"),
        None => upstream,
    };
    debug!(%target, "redirecting authorization request upstream");
    Redirect::temporary(&target).into_response()
}

pub(crate) async fn token(
    state: State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(oauth) = oauth(&state.0) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let endpoint = match oauth.token_endpoint().await {
        Ok(endpoint) => endpoint,
        Err(err) => return bad_gateway(err),
    };
    forward(oauth, &endpoint, &headers, body).await
}

pub(crate) async fn introspect(
    state: State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(oauth) = oauth(&state.0) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let endpoint = match oauth.introspection_endpoint().await {
        Ok(endpoint) => endpoint,
        Err(err) => return bad_gateway(err),
    };
    forward(oauth, &endpoint, &headers, body).await
}

pub(crate) async fn register(
    state: State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(oauth) = oauth(&state.0) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let endpoint = match oauth.provider_metadata().await {
        Ok(metadata) => metadata.registration_endpoint.clone(),
        Err(err) => return bad_gateway(err),
    };
    let Some(endpoint) = endpoint else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "upstream advertises no registration endpoint"})),
        )
            .into_response();
    };
    forward(oauth, &endpoint, &headers, body).await
}

/// Relay a POST upstream, preserving content type and credentials headers,
/// and mirror the upstream's status and body back to the caller.
async fn forward(
    oauth: &OAuthConfiguration,
    endpoint: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let mut request = oauth.http_client().post(endpoint).body(body.to_vec());
    for name in [header::CONTENT_TYPE, header::AUTHORIZATION] {
        if let Some(value) = headers.get(&name).and_then(|v| v.to_str().ok()) {
            let value = value.to_string();
            request = request.header(name, value);
        }
    }

    let upstream = match request.send().await {
        Ok(response) => response,
        Err(err) => return bad_gateway(err.into()),
    };
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => return bad_gateway(err.into()),
    };
    (status, [(header::CONTENT_TYPE, content_type)], bytes).into_response()
}
