use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::TokenSource;
use crate::error::{ErrorKind, RelayError, Result};

/// A cached bearer credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    pub value: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Default)]
struct Flight {
    last_failure: Option<(ErrorKind, String)>,
}

/// Process-wide credential cache with single-flight acquisition.
///
/// There is no expiry timer. Consumers that observe an authorization failure
/// call [`AuthTokenCache::invalidate`] and the next [`AuthTokenCache::get`]
/// re-acquires.
pub struct AuthTokenCache {
    source: Arc<dyn TokenSource>,
    cached: RwLock<Option<AuthToken>>,
    flight: Mutex<Flight>,
    /// Completed acquisitions, successful or not.
    attempts: AtomicU64,
}

impl AuthTokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
            flight: Mutex::new(Flight::default()),
            attempts: AtomicU64::new(0),
        }
    }

    /// The cached token, without acquiring.
    pub fn peek(&self) -> Option<AuthToken> {
        self.cached.read().clone()
    }

    /// Return the cached token, acquiring it on a miss.
    ///
    /// Callers racing on a miss share one acquisition: whoever holds the
    /// flight lock performs it, and the others observe its outcome, including
    /// a failure, instead of issuing their own round trip.
    pub async fn get(&self) -> Result<AuthToken> {
        if let Some(token) = self.peek() {
            return Ok(token);
        }

        let observed = self.attempts.load(Ordering::Acquire);
        let mut flight = self.flight.lock().await;

        if let Some(token) = self.peek() {
            return Ok(token);
        }
        if self.attempts.load(Ordering::Acquire) != observed
            && let Some((kind, detail)) = &flight.last_failure
        {
            return Err(RelayError::from_kind(*kind, detail.clone()));
        }

        debug!("Acquiring auth token");
        let result = self.source.acquire().await;
        self.attempts.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(value) => {
                let token = AuthToken {
                    value,
                    acquired_at: Utc::now(),
                };
                *self.cached.write() = Some(token.clone());
                flight.last_failure = None;
                info!("Auth token acquired");
                Ok(token)
            }
            Err(err) => {
                warn!(error = %err, "Auth token acquisition failed");
                flight.last_failure = Some((err.kind(), err.detail()));
                Err(err)
            }
        }
    }

    /// Drop the cached token so the next `get` re-acquires.
    pub fn invalidate(&self) {
        if self.cached.write().take().is_some() {
            info!("Auth token invalidated");
        }
    }

    /// Invalidate, then acquire a fresh token.
    pub async fn refresh(&self) -> Result<AuthToken> {
        self.invalidate();
        self.get().await
    }
}

impl std::fmt::Debug for AuthTokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthTokenCache")
            .field("cached", &self.cached.read().is_some())
            .field("attempts", &self.attempts.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
