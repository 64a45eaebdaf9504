//! Secret acquisition with a short-lived in-memory cache.
//!
//! Secrets come from the process environment, with a `.env` file loaded once
//! as a fallback (dotenvy). Lookups are cached for a short TTL so repeated
//! adapter constructions don't hammer the underlying store. A missing key is
//! Critical: nothing downstream can run without its credential.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{PipelineError, PipelineResult};
use crate::logging::log_debug;

static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    // Missing .env is fine; the environment itself is the primary source.
    let _ = dotenvy::dotenv();
});

/// TTL-cached secret lookup over env + `.env`.
#[derive(Debug)]
pub struct SecretStore {
    ttl: Duration,
    cache: Mutex<HashMap<String, (String, Instant)>>,
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl SecretStore {
    pub fn new(ttl: Duration) -> Self {
        Lazy::force(&DOTENV_LOADED);
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a secret by key.
    ///
    /// Returns [`PipelineError::MissingSecret`] (Critical) when the key is
    /// absent or empty in both the cache and the environment.
    pub fn get(&self, key: &str) -> PipelineResult<String> {
        {
            let cache = self.cache.lock().expect("secret cache poisoned");
            if let Some((value, fetched_at)) = cache.get(key) {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(value.clone());
                }
            }
        }

        let value = std::env::var(key)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| PipelineError::missing_secret(key))?;

        log_debug!(key = %key, "Secret fetched and cached");
        self.cache
            .lock()
            .expect("secret cache poisoned")
            .insert(key.to_string(), (value.clone(), Instant::now()));
        Ok(value)
    }

    /// Drop any cached value for `key`, forcing a refetch.
    pub fn invalidate(&self, key: &str) {
        self.cache
            .lock()
            .expect("secret cache poisoned")
            .remove(key);
    }
}
