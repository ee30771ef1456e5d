//! Shared provider traits for dependency injection.
//!
//! Time is the one ambient input the ledger depends on. Abstracting it behind
//! a trait lets TTL expiry be exercised deterministically in tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Trait for providing timestamps.
///
/// # Example
///
/// ```
/// use skyward::providers::{TimeProvider, SystemTimeProvider};
///
/// let provider = SystemTimeProvider;
/// let timestamp = provider.now_millis();
/// assert!(timestamp > 0);
/// ```
pub trait TimeProvider: Send + Sync {
    /// Returns the current Unix timestamp in milliseconds.
    fn now_millis(&self) -> u64;
}

/// Default time provider using system time.
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
///
/// Used by tests and by anything that needs to replay a timeline.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Starts the clock at `secs` Unix seconds.
    pub fn starting_at(secs: u64) -> Self {
        Self {
            millis: AtomicU64::new(secs * 1000),
        }
    }

    /// Moves the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.advance_millis(secs * 1000);
    }

    pub fn advance_millis(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeProvider for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

impl<T: TimeProvider + ?Sized> TimeProvider for std::sync::Arc<T> {
    fn now_millis(&self) -> u64 {
        (**self).now_millis()
    }
}
