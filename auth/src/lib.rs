//! Bearer-token validation for the HTTP transport: local JWT verification
//! with JWKS fetching, OAuth introspection, and OIDC metadata discovery.

mod error;
mod jwks;
mod jwt;
mod oauth;

pub use error::AuthError;
pub use error::Result;
pub use jwks::JwksCache;
pub use jwt::JwtValidator;
pub use jwt::TokenClaims;
pub use oauth::AuthorizationContext;
pub use oauth::OAuthConfiguration;
pub use oauth::ProviderMetadata;
pub use oauth::TokenValidating;
pub use oauth::TokenValidationMode;
