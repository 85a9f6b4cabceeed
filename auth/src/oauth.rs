//! OAuth-backed bearer validation: OIDC metadata discovery, JWT mode,
//! remote introspection, and a custom-validator escape hatch.

use crate::error::AuthError;
use crate::error::Result;
use crate::jwt::JwtValidator;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Identity established for a validated bearer token; attached to the
/// session by the transport.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationContext {
    pub subject: Option<String>,
    pub scopes: Vec<String>,
    pub claims: Map<String, Value>,
}

/// Pluggable token validation, for hosts that bring their own scheme.
#[async_trait]
pub trait TokenValidating: Send + Sync {
    async fn validate(&self, token: &str) -> Result<AuthorizationContext>;
}

/// How bearer tokens presented to the transport are checked.
#[derive(Clone, Default)]
pub enum TokenValidationMode {
    /// Verify locally as a JWT against the issuer's JWKS.
    #[default]
    Jwt,
    /// Ask the issuer's introspection endpoint.
    Introspection,
    /// Delegate to a host-supplied validator.
    Custom(Arc<dyn TokenValidating>),
}

/// The issuer's published OpenID configuration. Fetched lazily and reused;
/// the transparent proxy also serves a rewritten copy of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProviderMetadata {
    pub async fn discover(client: &reqwest::Client, issuer: &str) -> Result<ProviderMetadata> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        debug!(url, "discovering provider metadata");
        let metadata = client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<ProviderMetadata>()
            .await?;
        Ok(metadata)
    }
}

pub struct OAuthConfiguration {
    pub issuer: String,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub introspection_endpoint: Option<String>,
    pub jwks_endpoint: Option<String>,
    pub audience: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Serve the issuer's OAuth surface from the local origin, forwarding
    /// to the upstream.
    pub transparent_proxy: bool,
    validation: TokenValidationMode,
    client: reqwest::Client,
    metadata: OnceCell<ProviderMetadata>,
    jwt_validator: OnceCell<Arc<JwtValidator>>,
}

impl OAuthConfiguration {
    pub fn new(issuer: impl Into<String>) -> Self {
        OAuthConfiguration {
            issuer: issuer.into(),
            authorization_endpoint: None,
            token_endpoint: None,
            introspection_endpoint: None,
            jwks_endpoint: None,
            audience: None,
            client_id: None,
            client_secret: None,
            transparent_proxy: false,
            validation: TokenValidationMode::default(),
            client: reqwest::Client::new(),
            metadata: OnceCell::new(),
            jwt_validator: OnceCell::new(),
        }
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    pub fn with_jwks_endpoint(mut self, url: impl Into<String>) -> Self {
        self.jwks_endpoint = Some(url.into());
        self
    }

    pub fn with_introspection_endpoint(mut self, url: impl Into<String>) -> Self {
        self.introspection_endpoint = Some(url.into());
        self
    }

    pub fn with_validation(mut self, validation: TokenValidationMode) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_transparent_proxy(mut self) -> Self {
        self.transparent_proxy = true;
        self
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Lazily discovered issuer metadata, with explicitly configured
    /// endpoints taking precedence over the published document.
    pub async fn provider_metadata(&self) -> Result<&ProviderMetadata> {
        self.metadata
            .get_or_try_init(|| async {
                let mut metadata =
                    ProviderMetadata::discover(&self.client, &self.issuer).await?;
                if let Some(url) = &self.authorization_endpoint {
                    metadata.authorization_endpoint = Some(url.clone());
                }
                if let Some(url) = &self.token_endpoint {
                    metadata.token_endpoint = Some(url.clone());
                }
                if let Some(url) = &self.introspection_endpoint {
                    metadata.introspection_endpoint = Some(url.clone());
                }
                if let Some(url) = &self.jwks_endpoint {
                    metadata.jwks_uri = Some(url.clone());
                }
                Ok(metadata)
            })
            .await
    }

    pub async fn authorization_endpoint(&self) -> Result<String> {
        if let Some(url) = &self.authorization_endpoint {
            return Ok(url.clone());
        }
        self.provider_metadata()
            .await?
            .authorization_endpoint
            .clone()
            .ok_or_else(|| self.missing("authorization_endpoint"))
    }

    pub async fn token_endpoint(&self) -> Result<String> {
        if let Some(url) = &self.token_endpoint {
            return Ok(url.clone());
        }
        self.provider_metadata()
            .await?
            .token_endpoint
            .clone()
            .ok_or_else(|| self.missing("token_endpoint"))
    }

    pub async fn introspection_endpoint(&self) -> Result<String> {
        if let Some(url) = &self.introspection_endpoint {
            return Ok(url.clone());
        }
        self.provider_metadata()
            .await?
            .introspection_endpoint
            .clone()
            .ok_or_else(|| self.missing("introspection_endpoint"))
    }

    fn missing(&self, endpoint: &str) -> AuthError {
        AuthError::Discovery(format!("{} advertises no {endpoint}", self.issuer))
    }

    /// Validate a bearer token per the configured mode.
    pub async fn validate_token(&self, token: &str) -> Result<AuthorizationContext> {
        match &self.validation {
            TokenValidationMode::Custom(validator) => validator.validate(token).await,
            TokenValidationMode::Jwt => {
                let validator = self.jwt_validator().await;
                let claims = validator.validate(token).await?;
                Ok(AuthorizationContext {
                    subject: claims.subject,
                    scopes: claims.scopes,
                    claims: claims.claims,
                })
            }
            TokenValidationMode::Introspection => self.introspect(token).await,
        }
    }

    async fn jwt_validator(&self) -> &Arc<JwtValidator> {
        self.jwt_validator
            .get_or_init(|| async {
                let mut validator = JwtValidator::new().with_issuer(self.issuer.clone());
                if let Some(audience) = &self.audience {
                    validator = validator.with_audience(audience.clone());
                }
                if let Some(client_id) = &self.client_id {
                    validator = validator.with_client_id(client_id.clone());
                }
                if let Some(secret) = &self.client_secret {
                    validator = validator.with_hs256_secret(secret.clone());
                }
                if let Some(url) = &self.jwks_endpoint {
                    validator = validator.with_jwks_url(url.clone());
                }
                Arc::new(validator)
            })
            .await
    }

    async fn introspect(&self, token: &str) -> Result<AuthorizationContext> {
        let endpoint = self.introspection_endpoint().await?;
        let mut request = self
            .client
            .post(&endpoint)
            .form(&[("token", token), ("token_type_hint", "access_token")]);
        if let Some(client_id) = &self.client_id {
            request = request.basic_auth(client_id, self.client_secret.as_deref());
        }
        let response = request
            .send()
            .await?
            .error_for_status()?
            .json::<IntrospectionResponse>()
            .await?;

        if !response.active {
            return Err(AuthError::TokenInactive);
        }
        let scopes = response
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Ok(AuthorizationContext {
            subject: response.sub,
            scopes,
            claims: response.extra,
        })
    }
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}
