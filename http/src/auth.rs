//! Bearer authentication for every endpoint except the CORS preflight.
//!
//! Evaluation order: an installed OAuth configuration wins, then a static
//! bearer token, then open access.

use crate::AppState;
use axum::Json;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use serde_json::Value;
use serde_json::json;
use toolbus_auth::AuthorizationContext;
use tracing::debug;

/// Check the request's credentials. `Ok(Some(...))` carries the OAuth
/// identity to attach to the session; `Err` is the finished 401/403
/// response.
pub(crate) async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<AuthorizationContext>, Response> {
    if let Some(oauth) = &state.config.oauth {
        let Some(token) = bearer_token(headers) else {
            return Err(unauthorized(state));
        };
        let context = match oauth.validate_token(token).await {
            Ok(context) => context,
            Err(err) => {
                debug!("bearer token rejected: {err}");
                return Err(unauthorized(state));
            }
        };
        for scope in &state.config.required_scopes {
            if !context.scopes.contains(scope) {
                return Err(forbidden(scope));
            }
        }
        return Ok(Some(context));
    }

    if let Some(expected) = &state.config.bearer_token {
        return match bearer_token(headers) {
            Some(token) if token.as_bytes() == expected.as_bytes() => Ok(None),
            _ => Err(unauthorized(state)),
        };
    }

    Ok(None)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn unauthorized(state: &AppState) -> Response {
    let challenge = match &state.config.oauth {
        Some(oauth) => format!("Bearer resource_metadata=\"{}\"", oauth.issuer),
        None => "Bearer".to_string(),
    };
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        Json(json!({"error": "invalid_token"})),
    )
        .into_response()
}

fn forbidden(scope: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "error": "insufficient_scope",
            "scope": scope,
        })),
    )
        .into_response()
}

/// Map the validated identity onto the session-level record.
pub(crate) fn to_session_authorization(context: AuthorizationContext) -> toolbus_server::Authorization {
    toolbus_server::Authorization {
        subject: context.subject,
        scopes: context.scopes,
        claims: Value::Object(context.claims),
    }
}
