use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{clock::Clock, error::GatewayError};

/// How long before the provider's expiry a cached token stops being handed
/// out. Covers clock skew and requests already in flight.
pub const TOKEN_REFRESH_BUFFER_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub token: String,
    /// Expiry as reported by the provider, without the refresh buffer.
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(TOKEN_REFRESH_BUFFER_SECS) < self.expires_at
    }
}

/// Process-wide bearer token shared by every gateway call.
///
/// Readers share the lock on the fast path. A stale token is refreshed under
/// the write lock, and the freshness check is repeated after acquiring it so
/// that callers queued behind a refresh reuse its result instead of issuing
/// their own credential grant.
pub struct TokenCache {
    cached: RwLock<Option<AccessToken>>,
    clock: Arc<dyn Clock>,
}

impl TokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            cached: RwLock::new(None),
            clock,
        }
    }

    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<String, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken, GatewayError>>,
    {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(self.clock.now())) {
                return Ok(token.token.clone());
            }
        }

        let mut cached = self.cached.write().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(self.clock.now())) {
            return Ok(token.token.clone());
        }

        // On failure the stale entry stays put; the next caller retries.
        let fresh = fetch().await?;
        tracing::debug!(expires_at = %fresh.expires_at, "Refreshed gateway access token");
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    pub async fn store(&self, token: AccessToken) {
        *self.cached.write().await = Some(token);
    }

    /// Drops the cached token, e.g. after the provider rejected it.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    pub async fn current(&self) -> Option<AccessToken> {
        self.cached.read().await.clone()
    }
}
