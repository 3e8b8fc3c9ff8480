//! Migration locks
//!
//! A [`LockProvider`] is the only serialization point between engine
//! instances. Exactly one holder may run migrations for a key; everybody else
//! gets [`LockAcquisition::Denied`] and must treat that as "another instance is
//! migrating", not as a failure.

pub mod advisory;
pub mod file;
pub mod memory;

pub use advisory::{advisory_key, AdvisoryLockProvider};
pub use file::{FileLockProvider, LockFileRecord};
pub use memory::MemoryLockProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{LockError, LockResult};

/// A held lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockState {
    pub key: String,
    /// Unique per acquisition; only the owner may release
    pub owner_token: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockState {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            owner_token: Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
        }
    }
}

/// Outcome of a bounded acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired(LockState),
    /// Another holder kept the lock for the whole acquisition window
    Denied,
}

/// Acquisition limits
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl AcquireOptions {
    /// Delay before the retry following `attempt` (0-based): doubling, capped at 8x.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_interval * 2u32.pow(attempt.min(3))
    }
}

impl From<&EngineConfig> for AcquireOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            timeout: *config.get_lock_timeout(),
            max_retries: *config.get_lock_max_retries(),
            retry_interval: *config.get_lock_retry_interval(),
        }
    }
}

/// Mutual exclusion backend
#[async_trait]
pub trait LockProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Single non-blocking attempt. `Ok(None)` means the lock is held elsewhere.
    async fn try_acquire(&self, key: &str) -> LockResult<Option<LockState>>;

    /// Release a lock held under `token`. `Ok(false)` means this token did not hold it.
    async fn release(&self, key: &str, token: &str) -> LockResult<bool>;

    async fn is_locked(&self, key: &str) -> LockResult<bool>;

    /// Retry [`try_acquire`](Self::try_acquire) with backoff until the retry
    /// budget or the timeout runs out.
    ///
    /// Running out while someone holds the lock is [`LockAcquisition::Denied`].
    /// Running out with no holder in sight is [`LockError::Exhausted`].
    async fn acquire(&self, key: &str, options: &AcquireOptions) -> LockResult<LockAcquisition> {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(state) = self.try_acquire(key).await? {
                tracing::debug!(
                    "Acquired {} lock '{}' after {} attempt(s)",
                    self.name(),
                    key,
                    attempts
                );
                return Ok(LockAcquisition::Acquired(state));
            }

            let elapsed = started.elapsed();
            if attempts > options.max_retries || elapsed >= options.timeout {
                break;
            }

            let delay = options
                .backoff(attempts - 1)
                .min(options.timeout.saturating_sub(elapsed));
            tokio::time::sleep(delay).await;
        }

        if self.is_locked(key).await? {
            tracing::info!("Lock '{}' is held by another instance", key);
            Ok(LockAcquisition::Denied)
        } else {
            Err(LockError::Exhausted {
                key: key.to_string(),
                attempts,
            })
        }
    }
}

/// Release with bounded retries. Returns whether the lock is no longer held
/// by `state`'s owner.
pub async fn release_with_retry(
    provider: &dyn LockProvider,
    state: &LockState,
    attempts: u32,
    backoff: Duration,
) -> bool {
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        match provider.release(&state.key, &state.owner_token).await {
            Ok(true) => {
                tracing::debug!("Released {} lock '{}'", provider.name(), state.key);
                return true;
            }
            Ok(false) => {
                tracing::warn!(
                    "Lock '{}' was no longer held by this instance at release",
                    state.key
                );
                return true;
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to release lock '{}' (attempt {}/{}): {}",
                    state.key,
                    attempt,
                    attempts,
                    e
                );
                if attempt < attempts {
                    tokio::time::sleep(backoff * attempt).await;
                }
            }
        }
    }

    tracing::error!(
        "Giving up releasing {} lock '{}' after {} attempts; it blocks further migrations until removed",
        provider.name(),
        state.key,
        attempts
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_options() -> AcquireOptions {
        AcquireOptions {
            timeout: Duration::from_millis(200),
            max_retries: 3,
            retry_interval: Duration::from_millis(1),
        }
    }

    /// Never grants the lock; reports a holder depending on `held`
    struct BusyProvider {
        held: bool,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl LockProvider for BusyProvider {
        fn name(&self) -> &'static str {
            "busy"
        }

        async fn try_acquire(&self, _key: &str) -> LockResult<Option<LockState>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        async fn release(&self, _key: &str, _token: &str) -> LockResult<bool> {
            Ok(false)
        }

        async fn is_locked(&self, _key: &str) -> LockResult<bool> {
            Ok(self.held)
        }
    }

    /// Fails to release a configurable number of times
    struct FlakyRelease {
        failures_left: Mutex<u32>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LockProvider for FlakyRelease {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn try_acquire(&self, key: &str) -> LockResult<Option<LockState>> {
            Ok(Some(LockState::new(key)))
        }

        async fn release(&self, _key: &str, _token: &str) -> LockResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(LockError::Database("connection reset".into()));
            }
            Ok(true)
        }

        async fn is_locked(&self, _key: &str) -> LockResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let options = AcquireOptions {
            timeout: Duration::from_secs(30),
            max_retries: 10,
            retry_interval: Duration::from_millis(100),
        };
        assert_eq!(options.backoff(0), Duration::from_millis(100));
        assert_eq!(options.backoff(1), Duration::from_millis(200));
        assert_eq!(options.backoff(3), Duration::from_millis(800));
        assert_eq!(options.backoff(9), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_held_lock_is_denied_after_retries() {
        let provider = BusyProvider {
            held: true,
            attempts: AtomicU32::new(0),
        };
        let result = provider.acquire("k", &fast_options()).await.unwrap();
        assert_eq!(result, LockAcquisition::Denied);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_no_holder_is_exhausted_error() {
        let provider = BusyProvider {
            held: false,
            attempts: AtomicU32::new(0),
        };
        match provider.acquire("k", &fast_options()).await {
            Err(LockError::Exhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("Expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_is_retried() {
        let provider = FlakyRelease {
            failures_left: Mutex::new(2),
            calls: AtomicU32::new(0),
        };
        let state = LockState::new("k");
        assert!(release_with_retry(&provider, &state, 3, Duration::from_millis(1)).await);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_release_gives_up_after_attempts() {
        let provider = Arc::new(FlakyRelease {
            failures_left: Mutex::new(10),
            calls: AtomicU32::new(0),
        });
        let state = LockState::new("k");
        assert!(!release_with_retry(provider.as_ref(), &state, 3, Duration::from_millis(1)).await);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }
}
