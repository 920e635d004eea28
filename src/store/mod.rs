//! Key-value backend module
//!
//! The only path to persistent state. Provides:
//! - `KvBackend`, the opaque backend contract (strings, hashes, and
//!   optimistic compare-and-swap on one hash field or across several keys)
//! - `MemoryBackend` for development and tests
//! - `RedisBackend` for production
//! - `RetryPolicy`, the retry/backoff rules applied at the slot store boundary
//! - `KeySpace`, the naming scheme for every key the server writes

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Backend contract
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Set several fields of one hash in a single write
    async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;

    /// Atomically replace `field` if it still holds `expected`.
    ///
    /// `expected = None` means the field must be absent; `new = None` deletes
    /// the field. Returns `false` without writing when the current value
    /// differs from `expected`.
    async fn hcompare_and_swap(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Apply every write, or none of them.
    ///
    /// Each write carries its own expectation with the same meaning as in
    /// [`hcompare_and_swap`](Self::hcompare_and_swap). If any field no longer
    /// matches, nothing is written and `false` is returned.
    async fn hcommit(&self, writes: &[HashWrite]) -> Result<bool, StoreError>;

    /// Connectivity check
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Shared handle to a backend
pub type SharedBackend = Arc<dyn KvBackend>;

/// One guarded field write inside [`KvBackend::hcommit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashWrite {
    pub key: String,
    pub field: String,
    /// Value the field must still hold, `None` for absent
    pub expected: Option<String>,
    /// Value to store, `None` to delete the field
    pub new: Option<String>,
}

/// Key naming scheme
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Hash holding one slot collection, fields `slot_{n}`
    pub fn slots(&self, collection: &str, owner: u32) -> String {
        format!("{}:slots:{}:{}", self.prefix, collection, owner)
    }

    /// Hash holding a player's last saved position
    pub fn position(&self, owner: u32) -> String {
        format!("{}:position:{}", self.prefix, owner)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("realm")
    }
}

/// Retry rules for backend operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts made while the backend reports itself unavailable
    pub attempts: u32,
    /// Base delay, doubled after each unavailable attempt
    pub base_backoff: Duration,
    /// Re-runs allowed after a compare-and-swap conflict
    pub conflict_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
            conflict_retries: config.conflict_retries,
        }
    }

    /// Policy without delays, for tests
    pub fn immediate() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::ZERO,
            conflict_retries: 5,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// Exhausted conflict retries escalate to `StoreError::Unavailable`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut unavailable = 0u32;
        let mut conflicts = 0u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(StoreError::ConcurrencyConflict { key }) => {
                    conflicts += 1;
                    if conflicts > self.conflict_retries {
                        warn!(
                            operation = operation,
                            key = %key,
                            conflicts = conflicts,
                            "Conflict retries exhausted"
                        );
                        return Err(StoreError::Unavailable(format!(
                            "{} kept conflicting on {}",
                            operation, key
                        )));
                    }
                    debug!(operation = operation, key = %key, "Retrying after conflict");
                    tokio::task::yield_now().await;
                }
                Err(StoreError::Unavailable(reason)) => {
                    unavailable += 1;
                    if unavailable >= self.attempts {
                        warn!(
                            operation = operation,
                            attempts = unavailable,
                            reason = %reason,
                            "Backend unavailable, giving up"
                        );
                        return Err(StoreError::Unavailable(reason));
                    }
                    let delay = self.backoff(unavailable);
                    debug!(
                        operation = operation,
                        attempt = unavailable,
                        delay_ms = delay.as_millis() as u64,
                        "Backend unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Exponential backoff with up to 50% jitter
    fn backoff(&self, attempt: u32) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exp = self.base_backoff * 2u32.saturating_pow(attempt.saturating_sub(1).min(10));
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}
