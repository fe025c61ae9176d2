//! Sliding window limiter keyed by caller network identity.
//!
//! Each identity keeps the timestamps of its counted operations; an operation
//! is allowed while fewer than the limit fall inside the last `window`.
//! Counters live in a [`CounterStore`] so every dispatcher instance sharing the
//! store sees the same window. Updates go through versioned compare-and-swap;
//! a lost race reloads the window and tries again.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration as StdDuration,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hushbox_core::retry::{retry_with_backoff, RetryError, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identity used when the caller's network identity is unavailable. All such
/// callers share one window.
pub const FALLBACK_IDENTITY: &str = "unknown";

const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Operations allowed per window.
    pub max_operations: u32,
    pub window_secs: u64,
    /// Backoff for lost compare-and-swap races.
    pub cas_retry: RetryPolicy,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_operations: 10,
            window_secs: 5 * 60,
            cas_retry: RetryPolicy {
                max_attempts: 5,
                initial_backoff_ms: 1,
                max_backoff_ms: 50,
            },
        }
    }
}

impl RateLimitSettings {
    fn window(&self) -> Duration {
        Duration::seconds(self.window_secs.min(MAX_WINDOW_SECS) as i64)
    }
}

/// Counted operations of one identity, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowState {
    pub identity_key: String,
    pub events: Vec<DateTime<Utc>>,
}

impl WindowState {
    pub fn empty(identity_key: &str) -> Self {
        Self {
            identity_key: identity_key.to_string(),
            events: Vec::new(),
        }
    }

    /// Oldest counted operation still held.
    pub fn window_start(&self) -> Option<DateTime<Utc>> {
        self.events.first().copied()
    }

    pub fn count(&self) -> usize {
        self.events.len()
    }

    /// Forget operations at or before `cutoff`.
    fn slide(mut self, cutoff: DateTime<Utc>) -> Self {
        self.events.retain(|at| *at > cutoff);
        self
    }

    fn record(&mut self, at: DateTime<Utc>) {
        let pos = self.events.partition_point(|t| *t <= at);
        self.events.insert(pos, at);
    }
}

/// A stored value and the version it was written under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CounterStoreError {
    /// Another writer got there first.
    #[error("counter version conflict")]
    Conflict,
    #[error("counter store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Atomically updatable counter service.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn load(
        &self,
        identity_key: &str,
    ) -> Result<Option<Versioned<WindowState>>, CounterStoreError>;

    /// Write `state` if the stored version still equals `expected_version`
    /// (`None` meaning no counter exists yet). Returns the new version.
    async fn compare_and_swap(
        &self,
        identity_key: &str,
        expected_version: Option<u64>,
        state: WindowState,
    ) -> Result<u64, CounterStoreError>;

    /// Drop counters with no operation after `cutoff`. Returns how many went.
    /// Stores that expire entries on their own can keep the default.
    async fn prune(&self, _cutoff: DateTime<Utc>) -> Result<usize, CounterStoreError> {
        Ok(0)
    }
}

/// Process-wide counter store. Clones share the same counters.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCounterStore {
    inner: Arc<Mutex<HashMap<String, Versioned<WindowState>>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identities with a stored counter.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Versioned<WindowState>>>, CounterStoreError>
    {
        self.inner.lock().map_err(|err| CounterStoreError::Unavailable {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn load(
        &self,
        identity_key: &str,
    ) -> Result<Option<Versioned<WindowState>>, CounterStoreError> {
        Ok(self.lock()?.get(identity_key).cloned())
    }

    async fn compare_and_swap(
        &self,
        identity_key: &str,
        expected_version: Option<u64>,
        state: WindowState,
    ) -> Result<u64, CounterStoreError> {
        let mut map = self.lock()?;
        let current = map.get(identity_key).map(|entry| entry.version);
        if current != expected_version {
            return Err(CounterStoreError::Conflict);
        }
        let version = current.map_or(1, |v| v + 1);
        map.insert(
            identity_key.to_string(),
            Versioned {
                value: state,
                version,
            },
        );
        Ok(version)
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, CounterStoreError> {
        let mut map = self.lock()?;
        let before = map.len();
        map.retain(|_, entry| entry.value.events.last().is_some_and(|at| *at > cutoff));
        Ok(before - map.len())
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// The counter could not be read or written; callers must fail closed.
    #[error("rate limit counter unavailable: {reason}")]
    StoreUnavailable { reason: String },
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, settings: RateLimitSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Forget identities whose last counted operation left the window.
    pub async fn prune_idle(&self, now: DateTime<Utc>) -> Result<usize, RateLimitError> {
        self.store
            .prune(now - self.settings.window())
            .await
            .map_err(|err| RateLimitError::StoreUnavailable {
                reason: err.to_string(),
            })
    }

    /// Run [`prune_idle`](Self::prune_idle) every `every` until the task is
    /// aborted.
    pub fn spawn_pruner(self: Arc<Self>, every: StdDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.prune_idle(Utc::now()).await {
                    Ok(0) => {}
                    Ok(pruned) => info!(pruned, "idle rate counters pruned"),
                    Err(err) => warn!(error = %err, "rate counter pruning failed"),
                }
            }
        })
    }

    /// Count one operation for `identity` and report whether it may proceed.
    /// Denied operations are not counted.
    pub async fn check(&self, identity: Option<&str>) -> Result<RateDecision, RateLimitError> {
        self.check_at(identity, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        identity: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, RateLimitError> {
        let identity = normalize_identity(identity);
        let result = retry_with_backoff(
            &self.settings.cas_retry,
            |err: &CounterStoreError| matches!(err, CounterStoreError::Conflict),
            || self.try_count(identity, now),
        )
        .await;

        match result {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(identity, reset_at = %decision.reset_at, "rate limit reached");
                }
                Ok(decision)
            }
            // Sustained contention on one identity is itself a burst.
            Err(RetryError::Exhausted { attempts, .. }) => {
                warn!(identity, attempts, "rate counter contention, denying");
                Ok(RateDecision {
                    allowed: false,
                    remaining: 0,
                    reset_at: now + Duration::seconds(1),
                })
            }
            Err(RetryError::Fatal(err)) => Err(RateLimitError::StoreUnavailable {
                reason: err.to_string(),
            }),
        }
    }

    async fn try_count(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, CounterStoreError> {
        let window = self.settings.window();
        let (expected_version, mut state) = match self.store.load(identity).await? {
            Some(current) => (Some(current.version), current.value.slide(now - window)),
            None => (None, WindowState::empty(identity)),
        };
        let max = self.settings.max_operations as usize;

        if state.count() >= max {
            // A slot opens once enough of the oldest operations age out.
            let freeing = state.count() - max;
            let reset_at = state
                .events
                .get(freeing)
                .map_or(now + window, |at| *at + window);
            return Ok(RateDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            });
        }

        state.record(now);
        let remaining = (max - state.count()) as u32;
        let reset_at = state.window_start().unwrap_or(now) + window;
        self.store
            .compare_and_swap(identity, expected_version, state)
            .await?;
        Ok(RateDecision {
            allowed: true,
            remaining,
            reset_at,
        })
    }
}

/// Identity a caller is counted (and audited) under.
pub fn normalize_identity(identity: Option<&str>) -> &str {
    identity
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .unwrap_or(FALLBACK_IDENTITY)
}
