//! Shared counter store.
//!
//! Every process in the fleet coordinates through one counter store. Nothing in
//! this crate caches counter values in-process: the store is the only source of
//! truth, and each method below maps to a single pipelined round trip.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::InMemoryCounterStore;
pub use self::redis::RedisCounterStore;

/// Errors returned by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or timed out.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with something we did not expect.
    #[error("unexpected counter store reply: {0}")]
    Protocol(String),
}

/// State of a sliding window after expired entries were purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSnapshot {
    /// Entries still inside the window.
    pub count: u64,
    /// Score of the oldest surviving entry, if any.
    pub oldest_ms: Option<i64>,
}

/// Atomic counter primitives shared by the rate limiter and the connection
/// controller.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Remove entries of `key` scored below `window_start_ms`, then count what is
    /// left and read the oldest survivor.
    async fn trim_window(&self, key: &str, window_start_ms: i64)
        -> Result<WindowSnapshot, StoreError>;

    /// Add one entry to the window at `key` and refresh the key's TTL.
    async fn add_entry(
        &self,
        key: &str,
        score_ms: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Increment every key by one, refreshing each TTL. Returns the new values
    /// in key order.
    async fn increment_all(&self, keys: &[String], ttl: Duration) -> Result<Vec<i64>, StoreError>;

    /// Decrement every key by one, refreshing each TTL. Returns the new values
    /// in key order.
    async fn decrement_all(&self, keys: &[String], ttl: Duration) -> Result<Vec<i64>, StoreError>;

    /// Read counters without modifying them. Missing keys read as zero.
    async fn get_all(&self, keys: &[String]) -> Result<Vec<i64>, StoreError>;

    /// Remove a key outright.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Whole seconds covering `ttl`, never less than one.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Store doubles shared by unit tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A store whose every call fails while `down` is set, delegating to an
    /// in-memory store otherwise.
    #[derive(Default)]
    pub struct FlakyStore {
        pub inner: InMemoryCounterStore,
        pub down: AtomicBool,
    }

    impl FlakyStore {
        pub fn down() -> Self {
            let store = Self::default();
            store.set_down(true);
            store
        }

        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn trim_window(
            &self,
            key: &str,
            window_start_ms: i64,
        ) -> Result<WindowSnapshot, StoreError> {
            self.check()?;
            self.inner.trim_window(key, window_start_ms).await
        }

        async fn add_entry(
            &self,
            key: &str,
            score_ms: i64,
            member: &str,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            self.check()?;
            self.inner.add_entry(key, score_ms, member, ttl).await
        }

        async fn increment_all(
            &self,
            keys: &[String],
            ttl: Duration,
        ) -> Result<Vec<i64>, StoreError> {
            self.check()?;
            self.inner.increment_all(keys, ttl).await
        }

        async fn decrement_all(
            &self,
            keys: &[String],
            ttl: Duration,
        ) -> Result<Vec<i64>, StoreError> {
            self.check()?;
            self.inner.decrement_all(keys, ttl).await
        }

        async fn get_all(&self, keys: &[String]) -> Result<Vec<i64>, StoreError> {
            self.check()?;
            self.inner.get_all(keys).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.delete(key).await
        }
    }
}
