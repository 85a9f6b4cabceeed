use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("malformed token")]
    MalformedToken,

    /// Five-segment tokens are JWE; we only verify signed JWTs.
    #[error("encrypted tokens (JWE) are not supported")]
    JweNotSupported,

    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("HS256 token received but no shared secret is configured")]
    MissingSecret,

    #[error("no key in the JWKS matches kid {0:?}")]
    KeyNotFound(Option<String>),

    #[error("token is expired")]
    TokenExpired,

    #[error("token is not yet valid")]
    TokenNotYetValid,

    #[error("token issuer does not match the expected issuer")]
    IssuerMismatch,

    #[error("token audience does not include the expected audience")]
    AudienceMismatch,

    #[error("token authorized party does not match the expected client id")]
    AuthorizedPartyMismatch,

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token is not active")]
    TokenInactive,

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;
