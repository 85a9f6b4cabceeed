//! The SSE stream, the message POST endpoint, and the OpenAPI surface.

use crate::AppState;
use crate::auth::authorize;
use crate::auth::to_session_authorization;
use crate::openapi;
use axum::Json;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::response::sse::Event;
use axum::response::sse::KeepAlive;
use axum::response::sse::Sse;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use toolbus_protocol::JsonRpcMessage;
use tracing::debug;
use tracing::error;
use tracing::info;

/// Removes and closes the session when the SSE stream is dropped; in-flight
/// handlers observe cancellation through their request context.
struct SessionCleanup {
    state: Arc<AppState>,
    session_id: String,
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        let state = Arc::clone(&self.state);
        let session_id = std::mem::take(&mut self.session_id);
        tokio::spawn(async move {
            if let Some(session) = state.sessions.write().await.remove(&session_id) {
                session.close().await;
                info!(session = %session_id, "SSE stream closed; session dropped");
            }
        });
    }
}

pub(crate) async fn sse(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let identity = match authorize(&state, &headers).await {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
    let session = state.server.connect(outgoing_tx);
    if let Some(identity) = identity {
        session.set_authorization(to_session_authorization(identity));
    }
    let session_id = session.id().to_string();
    state
        .sessions
        .write()
        .await
        .insert(session_id.clone(), Arc::clone(&session));
    info!(session = %session_id, "SSE stream opened");

    let endpoint = format!("/messages/?session_id={session_id}");
    let cleanup = SessionCleanup {
        state: Arc::clone(&state),
        session_id,
    };
    let keepalive = state.config.keepalive;

    let stream = async_stream::stream! {
        // Moving the guard into the stream ties session lifetime to the
        // client's connection.
        let _cleanup = cleanup;
        yield Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint));
        while let Some(message) = outgoing_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => yield Ok(Event::default().event("message").data(json)),
                Err(err) => error!("failed to serialize outgoing message: {err}"),
            }
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keepalive))
        .into_response()
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesQuery {
    session_id: String,
}

pub(crate) async fn post_message(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessagesQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let identity = match authorize(&state, &headers).await {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };

    let session = {
        let sessions = state.sessions.read().await;
        sessions.get(&query.session_id).cloned()
    };
    let Some(session) = session else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown session"})),
        )
            .into_response();
    };
    if let Some(identity) = identity {
        session.set_authorization(to_session_authorization(identity));
    }

    let message: JsonRpcMessage = match serde_json::from_str(&body) {
        Ok(message) => message,
        Err(err) => {
            debug!(session = %query.session_id, "rejecting malformed frame: {err}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "parse error"})),
            )
                .into_response();
        }
    };

    // The response, if any, goes out over the SSE stream; the POST only
    // acknowledges receipt.
    session.handle_message(message).await;
    (StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response()
}

pub(crate) async fn openapi_document(State(state): State<Arc<AppState>>) -> Response {
    match openapi::document(&state.server) {
        Ok(document) => Json(document).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

pub(crate) async fn ai_plugin(State(state): State<Arc<AppState>>) -> Response {
    Json(openapi::ai_plugin_manifest(&state.server)).into_response()
}
