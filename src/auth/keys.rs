use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use thiserror::Error;
use tokio::sync::RwLock;

pub(crate) const GOOGLE_PUBLIC_KEYS_URL: &str =
    "https://www.googleapis.com/robot/v1/metadata/x509/securetoken@system.gserviceaccount.com";

const DEFAULT_MAX_AGE_SECS: u64 = 3600;

#[derive(Error, Debug)]
pub enum KeyFetchError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Key server returned {0}")]
    BadStatus(reqwest::StatusCode),
    #[error("No public key with kid {0}")]
    UnknownKid(String),
}

#[derive(Clone)]
struct CachedKeys {
    keys: HashMap<String, String>,
    expires_at: Instant,
}

/// Fetches and caches the PEM keys Google signs ID tokens with.
pub struct PublicKeyManager {
    client: Client,
    url: String,
    cache: Arc<RwLock<Option<CachedKeys>>>,
}

impl Default for PublicKeyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PublicKeyManager {
    pub fn new() -> Self {
        Self::with_url(GOOGLE_PUBLIC_KEYS_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            cache: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn get_key(&self, kid: &str) -> Result<String, KeyFetchError> {
        if let Some(key) = self.cached_key(kid).await {
            return Ok(key);
        }

        // Unknown kid or stale cache: Google may have rotated keys.
        self.refresh_keys().await?;

        self.cached_key(kid)
            .await
            .ok_or_else(|| KeyFetchError::UnknownKid(kid.to_string()))
    }

    async fn cached_key(&self, kid: &str) -> Option<String> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|cached| Instant::now() < cached.expires_at)
            .and_then(|cached| cached.keys.get(kid).cloned())
    }

    async fn refresh_keys(&self) -> Result<(), KeyFetchError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(KeyFetchError::BadStatus(response.status()));
        }

        let max_age = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|h| h.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(DEFAULT_MAX_AGE_SECS);

        let keys: HashMap<String, String> = response.json().await?;
        tracing::debug!(count = keys.len(), max_age, "refreshed token signing keys");

        let mut cache = self.cache.write().await;
        *cache = Some(CachedKeys {
            keys,
            expires_at: Instant::now() + Duration::from_secs(max_age),
        });

        Ok(())
    }
}

fn parse_max_age(cache_control: &str) -> Option<u64> {
    cache_control.split(',').find_map(|part| {
        part.trim()
            .strip_prefix("max-age=")
            .and_then(|age| age.parse::<u64>().ok())
    })
}
