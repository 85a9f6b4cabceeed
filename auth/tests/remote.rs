//! Tests against stubbed issuer endpoints: JWKS fetch/cache/retry,
//! OIDC discovery, and token introspection.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use pretty_assertions::assert_eq;
use serde_json::json;
use toolbus_auth::AuthError;
use toolbus_auth::JwksCache;
use toolbus_auth::OAuthConfiguration;
use toolbus_auth::TokenValidationMode;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_string_contains;
use wiremock::matchers::method;
use wiremock::matchers::path;

fn jwks_body() -> serde_json::Value {
    json!({
        "keys": [{
            "kty": "oct",
            "kid": "kid-a",
            "alg": "HS256",
            "k": URL_SAFE_NO_PAD.encode(b"shared-secret"),
        }]
    })
}

#[tokio::test]
async fn known_kid_resolves_from_a_single_fetch() {
    let issuer = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body()))
        .expect(1)
        .mount(&issuer)
        .await;

    let cache = JwksCache::default();
    let url = format!("{}/jwks", issuer.uri());
    cache
        .decoding_key(&url, Some("kid-a"))
        .await
        .expect("key should resolve");
    // Second lookup is served from the cache; the mock's expect(1) verifies
    // no second fetch happened.
    cache
        .decoding_key(&url, Some("kid-a"))
        .await
        .expect("cached key should resolve");
}

#[tokio::test]
async fn missing_kid_invalidates_and_retries_exactly_once() {
    let issuer = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body()))
        .expect(2)
        .mount(&issuer)
        .await;

    let cache = JwksCache::default();
    let url = format!("{}/jwks", issuer.uri());
    let err = cache
        .decoding_key(&url, Some("kid-unknown"))
        .await
        .map(|_| ())
        .expect_err("unknown kid must fail");
    let AuthError::KeyNotFound(kid) = err else {
        panic!("wrong error kind: {err}");
    };
    assert_eq!(kid.as_deref(), Some("kid-unknown"));
}

#[tokio::test]
async fn single_key_sets_do_not_need_a_kid() {
    let issuer = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body()))
        .mount(&issuer)
        .await;

    let cache = JwksCache::default();
    let url = format!("{}/jwks", issuer.uri());
    cache
        .decoding_key(&url, None)
        .await
        .expect("single-key fallback should resolve");
}

#[tokio::test]
async fn cache_control_max_age_expires_the_entry() {
    let issuer = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(jwks_body())
                .insert_header("Cache-Control", "max-age=0"),
        )
        .expect(2)
        .mount(&issuer)
        .await;

    let cache = JwksCache::default();
    let url = format!("{}/jwks", issuer.uri());
    cache.decoding_key(&url, Some("kid-a")).await.expect("first");
    // max-age=0 means the entry is already stale; the next lookup refetches.
    cache.decoding_key(&url, Some("kid-a")).await.expect("second");
}

#[tokio::test]
async fn discovery_fills_missing_endpoints() {
    let issuer = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": issuer.uri(),
            "authorization_endpoint": format!("{}/authorize", issuer.uri()),
            "token_endpoint": format!("{}/token", issuer.uri()),
            "jwks_uri": format!("{}/jwks", issuer.uri()),
            "introspection_endpoint": format!("{}/introspect", issuer.uri()),
        })))
        .expect(1)
        .mount(&issuer)
        .await;

    let config = OAuthConfiguration::new(issuer.uri());
    assert_eq!(
        config.token_endpoint().await.expect("token endpoint"),
        format!("{}/token", issuer.uri())
    );
    // Served from the cached document, not a second fetch.
    assert_eq!(
        config
            .authorization_endpoint()
            .await
            .expect("authorization endpoint"),
        format!("{}/authorize", issuer.uri())
    );
}

#[tokio::test]
async fn explicit_endpoints_override_the_published_document() {
    let issuer = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": issuer.uri(),
            "token_endpoint": format!("{}/token", issuer.uri()),
        })))
        .mount(&issuer)
        .await;

    let config =
        OAuthConfiguration::new(issuer.uri()).with_introspection_endpoint("https://override/introspect");
    let metadata = config.provider_metadata().await.expect("metadata");
    assert_eq!(
        metadata.introspection_endpoint.as_deref(),
        Some("https://override/introspect")
    );
}

#[tokio::test]
async fn introspection_accepts_active_tokens() {
    let issuer = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/introspect"))
        .and(body_string_contains("token=good-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "active": true,
            "sub": "user-7",
            "scope": "mcp:read mcp:write",
        })))
        .mount(&issuer)
        .await;

    let config = OAuthConfiguration::new(issuer.uri())
        .with_client_id("client")
        .with_client_secret("secret")
        .with_introspection_endpoint(format!("{}/introspect", issuer.uri()))
        .with_validation(TokenValidationMode::Introspection);

    let context = config
        .validate_token("good-token")
        .await
        .expect("active token validates");
    assert_eq!(context.subject.as_deref(), Some("user-7"));
    assert_eq!(
        context.scopes,
        vec!["mcp:read".to_string(), "mcp:write".to_string()]
    );
}

#[tokio::test]
async fn introspection_rejects_inactive_tokens() {
    let issuer = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/introspect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"active": false})))
        .mount(&issuer)
        .await;

    let config = OAuthConfiguration::new(issuer.uri())
        .with_introspection_endpoint(format!("{}/introspect", issuer.uri()))
        .with_validation(TokenValidationMode::Introspection);

    let err = config
        .validate_token("revoked-token")
        .await
        .expect_err("inactive token must fail");
    assert!(matches!(err, AuthError::TokenInactive));
}
