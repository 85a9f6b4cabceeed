//! Issuer-keyed JWKS cache.
//!
//! Key sets are fetched over HTTPS and cached for the duration advertised by
//! the response's `Cache-Control: max-age` (one hour when absent). A lookup
//! miss after a fresh fetch means the key genuinely is not there.

use crate::error::AuthError;
use crate::error::Result;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::JwkSet;
use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_TTL: Duration = Duration::from_secs(3600);

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedJwks {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }
}

pub struct JwksCache {
    client: reqwest::Client,
    entries: Mutex<HashMap<String, CachedJwks>>,
}

impl Default for JwksCache {
    fn default() -> Self {
        JwksCache::new(reqwest::Client::new())
    }
}

impl JwksCache {
    pub fn new(client: reqwest::Client) -> Self {
        JwksCache {
            client,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the decoding key for `kid` from the key set at `jwks_url`.
    /// When the cached set does not contain the key, the cache entry is
    /// invalidated and the fetch retried exactly once before giving up with
    /// `KeyNotFound`.
    pub async fn decoding_key(&self, jwks_url: &str, kid: Option<&str>) -> Result<DecodingKey> {
        if let Some(key) = self.select(jwks_url, kid).await? {
            return Ok(key);
        }
        debug!(jwks_url, ?kid, "key not in cached JWKS; refetching once");
        self.invalidate(jwks_url).await;
        match self.select(jwks_url, kid).await? {
            Some(key) => Ok(key),
            None => Err(AuthError::KeyNotFound(kid.map(str::to_string))),
        }
    }

    pub async fn invalidate(&self, jwks_url: &str) {
        self.entries.lock().await.remove(jwks_url);
    }

    async fn select(&self, jwks_url: &str, kid: Option<&str>) -> Result<Option<DecodingKey>> {
        let mut entries = self.entries.lock().await;
        let needs_fetch = !entries.get(jwks_url).is_some_and(CachedJwks::is_fresh);
        if needs_fetch {
            let fetched = self.fetch(jwks_url).await?;
            entries.insert(jwks_url.to_string(), fetched);
        }
        let Some(cached) = entries.get(jwks_url) else {
            return Ok(None);
        };

        let jwk = match kid {
            Some(kid) => cached.keys.find(kid),
            // A single-key JWKS is unambiguous even without a kid.
            None if cached.keys.keys.len() == 1 => cached.keys.keys.first(),
            None => None,
        };
        match jwk {
            Some(jwk) => Ok(Some(DecodingKey::from_jwk(jwk)?)),
            None => Ok(None),
        }
    }

    async fn fetch(&self, jwks_url: &str) -> Result<CachedJwks> {
        debug!(jwks_url, "fetching JWKS");
        let response = self.client.get(jwks_url).send().await?.error_for_status()?;
        let ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(DEFAULT_TTL);
        let keys: JwkSet = response.json().await?;
        Ok(CachedJwks {
            keys,
            fetched_at: Instant::now(),
            ttl,
        })
    }
}

fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control.split(',').find_map(|directive| {
        let (name, value) = directive.trim().split_once('=')?;
        if name.eq_ignore_ascii_case("max-age") {
            value.trim().parse::<u64>().ok().map(Duration::from_secs)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_age_is_parsed_from_cache_control() {
        assert_eq!(
            parse_max_age("public, max-age=120, must-revalidate"),
            Some(Duration::from_secs(120))
        );
        assert_eq!(parse_max_age("no-store"), None);
        assert_eq!(parse_max_age("max-age=oops"), None);
    }
}
