use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::security::errors::AuthError;

/// Vault session token plus its lifetime.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    value: String,
    /// `None` for tokens that never expire (static fallback tokens).
    expires_at: Option<DateTime<Utc>>,
    /// Lease granted at login; caps the renewal margin for short leases.
    lease: Option<Duration>,
    renewable: bool,
    accessor: Option<String>,
    policies: Vec<String>,
}

impl SessionToken {
    pub fn new(value: impl Into<String>, expires_at: Option<DateTime<Utc>>, renewable: bool) -> Self {
        Self {
            value: value.into(),
            expires_at,
            lease: None,
            renewable,
            accessor: None,
            policies: Vec::new(),
        }
    }

    /// Token valid for `lease` from now.
    pub fn with_lease(value: impl Into<String>, lease: Duration, renewable: bool) -> Self {
        let expires_at = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| Utc::now().checked_add_signed(lease));
        Self {
            lease: Some(lease),
            ..Self::new(value, expires_at, renewable)
        }
    }

    /// Token that is never refreshed.
    pub fn non_expiring(value: impl Into<String>) -> Self {
        Self::new(value, None, false)
    }

    pub fn with_accessor(mut self, accessor: Option<String>) -> Self {
        self.accessor = accessor;
        self
    }

    pub fn with_policies(mut self, policies: Vec<String>) -> Self {
        self.policies = policies;
        self
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn lease(&self) -> Option<Duration> {
        self.lease
    }

    pub fn renewable(&self) -> bool {
        self.renewable
    }

    pub fn accessor(&self) -> Option<&str> {
        self.accessor.as_deref()
    }

    pub fn policies(&self) -> &[String] {
        &self.policies
    }

    /// True while `now < expires_at - margin`.
    ///
    /// The margin never exceeds half the lease, so a lease shorter than the
    /// configured margin is still reused for part of its life.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = self.lease.map_or(margin, |lease| margin.min(lease / 2));
        match self.expires_at {
            None => true,
            Some(expires_at) => (expires_at - now)
                .to_std()
                .map(|left| left > margin)
                .unwrap_or(false),
        }
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("lease", &self.lease)
            .field("renewable", &self.renewable)
            .field("accessor", &self.accessor.as_ref().map(|_| "<redacted>"))
            .field("policies", &self.policies)
            .finish()
    }
}

/// Shared session-token cache with demand-driven, single-flight refresh.
///
/// Readers of a fresh token only take the read lock. A caller that finds the
/// token stale queues on `refresh`; the first one in runs the exchange and
/// the rest receive its outcome, success or failure.
#[derive(Debug, Clone)]
pub struct TokenCache {
    margin: Duration,
    token: Arc<RwLock<Option<SessionToken>>>,
    last_refreshed: Arc<RwLock<Option<DateTime<Utc>>>>,
    refresh: Arc<Mutex<Option<Result<SessionToken, AuthError>>>>,
    generation: Arc<AtomicU64>,
}

impl TokenCache {
    /// Empty cache; the first `get` performs an exchange.
    pub fn new(margin: Duration) -> Self {
        Self {
            margin,
            token: Arc::new(RwLock::new(None)),
            last_refreshed: Arc::new(RwLock::new(None)),
            refresh: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cache pre-loaded with `token`.
    pub fn seeded(token: SessionToken, margin: Duration) -> Self {
        Self {
            token: Arc::new(RwLock::new(Some(token))),
            last_refreshed: Arc::new(RwLock::new(Some(Utc::now()))),
            ..Self::new(margin)
        }
    }

    /// Return a fresh token, running `exchange` at most once across
    /// concurrent callers when a refresh is needed.
    pub async fn get<F, Fut>(&self, exchange: F) -> Result<SessionToken, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SessionToken, AuthError>>,
    {
        if let Some(token) = self.fresh_token().await {
            return Ok(token);
        }

        let seen = self.generation.load(Ordering::Acquire);
        let mut flight = self.refresh.lock().await;

        if let Some(token) = self.fresh_token().await {
            return Ok(token);
        }
        // A refresh completed while we were queued: share its outcome.
        if self.generation.load(Ordering::Acquire) != seen {
            if let Some(outcome) = flight.as_ref() {
                debug!("sharing outcome of concurrent token refresh");
                return outcome.clone();
            }
        }

        debug!("refreshing session token");
        let outcome = exchange().await;
        if let Ok(token) = &outcome {
            self.swap(token.clone()).await;
        }
        *flight = Some(outcome.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    /// Copy of the cached token, fresh or not.
    pub async fn current(&self) -> Option<SessionToken> {
        self.token.read().await.clone()
    }

    async fn fresh_token(&self) -> Option<SessionToken> {
        let guard = self.token.read().await;
        guard
            .as_ref()
            .filter(|t| t.is_fresh_at(Utc::now(), self.margin))
            .cloned()
    }

    async fn swap(&self, new_token: SessionToken) {
        *self.token.write().await = Some(new_token);
        let mut last_refreshed = self.last_refreshed.write().await;
        *last_refreshed = Some(Utc::now());
        debug!("Session token refreshed at {:?}", last_refreshed);
    }

    /// Time the cache last stored a token.
    pub async fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        *self.last_refreshed.read().await
    }

    /// Seconds since the last stored token, if any.
    pub async fn age_seconds(&self) -> Option<u64> {
        self.last_refreshed()
            .await
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
    }
}
