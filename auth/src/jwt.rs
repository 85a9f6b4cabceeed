//! Bearer JWT validation.
//!
//! Shape and algorithm checks happen by hand so the error taxonomy stays
//! precise; signature, `exp`, and `nbf` verification is delegated to
//! `jsonwebtoken` over the exact `header.payload` bytes as received. Claim
//! checks run in a fixed order: expiry, not-before, issuer, audience,
//! authorized party.

use crate::error::AuthError;
use crate::error::Result;
use crate::jwks::JwksCache;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::Algorithm;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::Validation;
use jsonwebtoken::errors::ErrorKind;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::OnceCell;

/// Clock skew allowance for `exp`/`nbf`, in seconds.
const DEFAULT_LEEWAY_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct JoseHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// Claims extracted from a successfully validated token.
#[derive(Debug, Clone, Default)]
pub struct TokenClaims {
    pub subject: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: Option<u64>,
    pub claims: Map<String, Value>,
}

impl TokenClaims {
    pub(crate) fn from_map(claims: Map<String, Value>) -> Self {
        let subject = claims.get("sub").and_then(Value::as_str).map(str::to_string);
        let scopes = claims
            .get("scope")
            .and_then(Value::as_str)
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let expires_at = claims.get("exp").and_then(Value::as_u64);
        TokenClaims {
            subject,
            scopes,
            expires_at,
            claims,
        }
    }
}

pub struct JwtValidator {
    expected_issuer: Option<String>,
    expected_audience: Option<String>,
    expected_client_id: Option<String>,
    hs256_secret: Option<String>,
    jwks_url: Option<String>,
    resolved_jwks_url: OnceCell<String>,
    jwks: JwksCache,
    client: reqwest::Client,
    leeway_secs: u64,
}

impl JwtValidator {
    pub fn new() -> Self {
        let client = reqwest::Client::new();
        JwtValidator {
            expected_issuer: None,
            expected_audience: None,
            expected_client_id: None,
            hs256_secret: None,
            jwks_url: None,
            resolved_jwks_url: OnceCell::new(),
            jwks: JwksCache::new(client.clone()),
            client,
            leeway_secs: DEFAULT_LEEWAY_SECS,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.expected_issuer = Some(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.expected_audience = Some(audience.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.expected_client_id = Some(client_id.into());
        self
    }

    pub fn with_hs256_secret(mut self, secret: impl Into<String>) -> Self {
        self.hs256_secret = Some(secret.into());
        self
    }

    /// Explicit JWKS URL; skips OIDC discovery.
    pub fn with_jwks_url(mut self, url: impl Into<String>) -> Self {
        self.jwks_url = Some(url.into());
        self
    }

    pub fn with_leeway_secs(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs;
        self
    }

    pub async fn validate(&self, token: &str) -> Result<TokenClaims> {
        let header = decode_header(token)?;
        let algorithm = supported_algorithm(&header.alg)?;

        let key = self.decoding_key(algorithm, header.kid.as_deref()).await?;
        let claims = self.verify_signed(token, algorithm, &key)?;
        self.check_claims(&claims)?;
        Ok(TokenClaims::from_map(claims))
    }

    async fn decoding_key(&self, algorithm: Algorithm, kid: Option<&str>) -> Result<DecodingKey> {
        match algorithm {
            Algorithm::HS256 => match &self.hs256_secret {
                Some(secret) => Ok(DecodingKey::from_secret(secret.as_bytes())),
                None => Err(AuthError::MissingSecret),
            },
            _ => {
                let jwks_url = self.jwks_url().await?;
                self.jwks.decoding_key(jwks_url, kid).await
            }
        }
    }

    /// JWKS endpoint: configured explicitly, or discovered from the issuer's
    /// OpenID configuration on first use.
    async fn jwks_url(&self) -> Result<&str> {
        self.resolved_jwks_url
            .get_or_try_init(|| async {
                if let Some(url) = &self.jwks_url {
                    return Ok(url.clone());
                }
                let Some(issuer) = &self.expected_issuer else {
                    return Err(AuthError::Discovery(
                        "no issuer or JWKS endpoint configured".to_string(),
                    ));
                };
                let metadata =
                    crate::oauth::ProviderMetadata::discover(&self.client, issuer).await?;
                metadata.jwks_uri.ok_or_else(|| {
                    AuthError::Discovery(format!("{issuer} advertises no jwks_uri"))
                })
            })
            .await
            .map(String::as_str)
    }

    fn verify_signed(
        &self,
        token: &str,
        algorithm: Algorithm,
        key: &DecodingKey,
    ) -> Result<Map<String, Value>> {
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.leeway_secs;
        validation.validate_nbf = true;
        // Audience and issuer are checked by hand below so that mismatches
        // map onto the precise error kinds.
        validation.validate_aud = false;

        let decoded = jsonwebtoken::decode::<Map<String, Value>>(token, key, &validation)
            .map_err(|err| match err.into_kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                ErrorKind::ImmatureSignature => AuthError::TokenNotYetValid,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                kind => AuthError::Jwt(kind.into()),
            })?;
        Ok(decoded.claims)
    }

    fn check_claims(&self, claims: &Map<String, Value>) -> Result<()> {
        if let Some(expected) = &self.expected_issuer {
            let issuer = claims.get("iss").and_then(Value::as_str);
            if issuer != Some(expected.as_str()) {
                return Err(AuthError::IssuerMismatch);
            }
        }
        if let Some(expected) = &self.expected_audience {
            if !audience_contains(claims.get("aud"), expected) {
                return Err(AuthError::AudienceMismatch);
            }
        }
        if let Some(expected) = &self.expected_client_id {
            let azp = claims.get("azp").and_then(Value::as_str);
            if azp != Some(expected.as_str()) {
                return Err(AuthError::AuthorizedPartyMismatch);
            }
        }
        Ok(())
    }
}

impl Default for JwtValidator {
    fn default() -> Self {
        JwtValidator::new()
    }
}

/// `aud` may be a single string or an array of strings.
fn audience_contains(aud: Option<&Value>, expected: &str) -> bool {
    match aud {
        Some(Value::String(aud)) => aud == expected,
        Some(Value::Array(entries)) => entries
            .iter()
            .any(|entry| entry.as_str() == Some(expected)),
        _ => false,
    }
}

fn decode_header(token: &str) -> Result<JoseHeader> {
    let segments: Vec<&str> = token.split('.').collect();
    match segments.len() {
        3 => {}
        5 => return Err(AuthError::JweNotSupported),
        _ => return Err(AuthError::MalformedToken),
    }
    let header_bytes = URL_SAFE_NO_PAD
        .decode(segments[0])
        .map_err(|_| AuthError::MalformedToken)?;
    serde_json::from_slice(&header_bytes).map_err(|_| AuthError::MalformedToken)
}

fn supported_algorithm(alg: &str) -> Result<Algorithm> {
    match alg {
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "ES256" => Ok(Algorithm::ES256),
        "ES384" => Ok(Algorithm::ES384),
        "HS256" => Ok(Algorithm::HS256),
        other => Err(AuthError::UnsupportedAlgorithm(other.to_string())),
    }
}
