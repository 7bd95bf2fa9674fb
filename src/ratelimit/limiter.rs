//! Sliding-window rate limiter.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::key::{OperationClass, RateLimitKey};
use super::rules::{RateLimitPresets, RateLimitRule};
use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitingConfig;
use crate::error::Result;
use crate::store::{CounterStore, StoreError};

/// Default prefix for window keys in the counter store.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    /// Whether the caller may proceed
    pub allowed: bool,
    /// Further admissions possible before the window rejects
    pub remaining: u64,
    /// When the window next has capacity (epoch ms)
    pub reset_at_ms: i64,
}

impl RateLimitResult {
    /// `reset_at_ms` as a wall-clock instant.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.reset_at_ms)
    }

    /// Milliseconds from `now_ms` until the window has capacity again.
    pub fn retry_after_ms(&self, now_ms: i64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).max(0) as u64
    }

    /// The answer given while the counter store is unavailable.
    fn fail_open(rule: RateLimitRule, now_ms: i64) -> Self {
        Self {
            allowed: true,
            remaining: rule.max_requests.saturating_sub(1),
            reset_at_ms: now_ms.saturating_add(rule.window_ms as i64),
        }
    }
}

/// A rolling-window rate limiter shared by every process using the same
/// counter store.
///
/// The purge/count and the write of a new entry are two separate round trips,
/// so concurrent callers on one key can briefly admit slightly more than
/// `max_requests`. If the store fails the limiter admits the request.
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    presets: RateLimitPresets,
    key_prefix: String,
}

impl SlidingWindowLimiter {
    /// Create a limiter with default presets and the system clock.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            presets: RateLimitPresets::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Create a limiter from configuration.
    pub fn from_config(store: Arc<dyn CounterStore>, config: &RateLimitingConfig) -> Result<Self> {
        config.presets.validate()?;
        Ok(Self::new(store)
            .with_presets(config.presets.clone())
            .with_key_prefix(&config.key_prefix))
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the per-operation presets.
    pub fn with_presets(mut self, presets: RateLimitPresets) -> Self {
        self.presets = presets;
        self
    }

    /// Namespace window keys under `prefix`.
    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    /// The presets in use.
    pub fn presets(&self) -> &RateLimitPresets {
        &self.presets
    }

    /// May `key` perform one more unit of work inside a `window_ms` window
    /// capped at `max_requests`?
    ///
    /// Only a zero-length window is an error; counter store failures admit the
    /// request.
    pub async fn check_rate_limit(
        &self,
        key: &str,
        max_requests: u64,
        window_ms: u64,
    ) -> Result<RateLimitResult> {
        self.check_rule(&RateLimitKey::new(key), RateLimitRule::new(max_requests, window_ms))
            .await
    }

    /// Check `key` against `rule`.
    pub async fn check_rule(&self, key: &RateLimitKey, rule: RateLimitRule) -> Result<RateLimitResult> {
        rule.validate()?;
        let now = self.clock.now_ms();

        if rule.max_requests == 0 {
            return Ok(RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_at_ms: now.saturating_add(rule.window_ms as i64),
            });
        }

        let store_key = self.store_key(key);
        match self.admit(&store_key, rule, now).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    "Counter store unavailable, allowing request"
                );
                Ok(RateLimitResult::fail_open(rule, now))
            }
        }
    }

    /// Check the preset limit for an operation class.
    pub async fn check_operation(
        &self,
        class: OperationClass,
        subject: &str,
    ) -> Result<RateLimitResult> {
        let key = RateLimitKey::for_operation(class, subject);
        self.check_rule(&key, self.presets.rule(class)).await
    }

    /// AI queries made by a user.
    pub async fn check_ai(&self, user_id: &str) -> Result<RateLimitResult> {
        self.check_operation(OperationClass::Ai, user_id).await
    }

    /// Emails sent by a user.
    pub async fn check_email_by_user(&self, user_id: &str) -> Result<RateLimitResult> {
        self.check_operation(OperationClass::EmailByUser, user_id).await
    }

    /// Emails delivered to one recipient.
    pub async fn check_email_by_recipient(&self, recipient: &str) -> Result<RateLimitResult> {
        self.check_operation(OperationClass::EmailByRecipient, &recipient.to_lowercase())
            .await
    }

    /// Emails sent by everyone.
    pub async fn check_email_global(&self) -> Result<RateLimitResult> {
        self.check_operation(OperationClass::EmailGlobal, "").await
    }

    /// SMS messages sent by a user.
    pub async fn check_sms(&self, user_id: &str) -> Result<RateLimitResult> {
        self.check_operation(OperationClass::Sms, user_id).await
    }

    /// Generic API calls made with a caller key.
    pub async fn check_api(&self, caller: &str) -> Result<RateLimitResult> {
        self.check_operation(OperationClass::Api, caller).await
    }

    async fn admit(
        &self,
        store_key: &str,
        rule: RateLimitRule,
        now: i64,
    ) -> std::result::Result<RateLimitResult, StoreError> {
        let window_ms = rule.window_ms as i64;
        let window_start = now.saturating_sub(window_ms);

        let snapshot = self.store.trim_window(store_key, window_start).await?;

        trace!(
            key = %store_key,
            count = snapshot.count,
            limit = rule.max_requests,
            "Checking rate limit"
        );

        if snapshot.count >= rule.max_requests {
            // Rejections do not record an entry.
            let reset_at_ms = snapshot
                .oldest_ms
                .map(|oldest| oldest.saturating_add(window_ms))
                .unwrap_or(now);

            debug!(
                key = %store_key,
                count = snapshot.count,
                limit = rule.max_requests,
                reset_at_ms,
                "Rate limit exceeded"
            );
            return Ok(RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_at_ms,
            });
        }

        self.store
            .add_entry(store_key, now, &entry_member(now), rule.key_ttl())
            .await?;

        Ok(RateLimitResult {
            allowed: true,
            remaining: rule.max_requests - snapshot.count - 1,
            reset_at_ms: snapshot.oldest_ms.unwrap_or(now).saturating_add(window_ms),
        })
    }

    fn store_key(&self, key: &RateLimitKey) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }
}

/// Unique window member: the timestamp plus a random suffix so requests landing
/// in the same millisecond stay distinct.
fn entry_member(now_ms: i64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!("{now_ms}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::AdmissionError;
    use crate::store::testing::FlakyStore;
    use crate::store::InMemoryCounterStore;

    const T0: i64 = 1_700_000_000_000;

    fn test_limiter() -> (SlidingWindowLimiter, ManualClock, Arc<InMemoryCounterStore>) {
        let clock = ManualClock::new(T0);
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = SlidingWindowLimiter::new(store.clone()).with_clock(Arc::new(clock.clone()));
        (limiter, clock, store)
    }

    #[tokio::test]
    async fn test_admission_is_monotonic() {
        let (limiter, _clock, _store) = test_limiter();

        for expected in (0..5).rev() {
            let result = limiter.check_rate_limit("k", 5, 60_000).await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected);
        }
    }

    #[tokio::test]
    async fn test_rejected_calls_do_not_consume_capacity() {
        let (limiter, _clock, store) = test_limiter();

        for _ in 0..3 {
            limiter.check_rate_limit("k", 3, 60_000).await.unwrap();
        }
        for _ in 0..5 {
            let result = limiter.check_rate_limit("k", 3, 60_000).await.unwrap();
            assert!(!result.allowed);
            assert_eq!(result.remaining, 0);
        }

        let snapshot = store.trim_window("ratelimit:k", 0).await.unwrap();
        assert_eq!(snapshot.count, 3);
    }

    #[tokio::test]
    async fn test_window_rejects_and_recovers() {
        let (limiter, clock, _store) = test_limiter();

        // Five calls at t=0
        let mut remaining = Vec::new();
        for _ in 0..5 {
            let result = limiter.check_rate_limit("scenario", 5, 1000).await.unwrap();
            assert!(result.allowed);
            remaining.push(result.remaining);
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        // Sixth at t=10ms is rejected until the first entry ages out
        clock.advance(10);
        let rejected = limiter.check_rate_limit("scenario", 5, 1000).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.reset_at_ms, T0 + 1000);
        assert_eq!(rejected.retry_after_ms(clock.now_ms()), 990);

        // t=1000ms: the entries at t=0 are still exactly inside the window
        clock.set(T0 + 1000);
        assert!(!limiter.check_rate_limit("scenario", 5, 1000).await.unwrap().allowed);

        // t=1001ms: capacity is back
        clock.set(T0 + 1001);
        let result = limiter.check_rate_limit("scenario", 5, 1000).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn test_window_is_rolling() {
        let (limiter, clock, _store) = test_limiter();

        limiter.check_rate_limit("k", 2, 1000).await.unwrap();
        clock.advance(600);
        let second = limiter.check_rate_limit("k", 2, 1000).await.unwrap();
        assert!(second.allowed);
        // The oldest entry decides when capacity returns
        assert_eq!(second.reset_at_ms, T0 + 1000);

        // At t=1001 only the first entry has expired
        clock.set(T0 + 1001);
        let third = limiter.check_rate_limit("k", 2, 1000).await.unwrap();
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);

        let fourth = limiter.check_rate_limit("k", 2, 1000).await.unwrap();
        assert!(!fourth.allowed);
        assert_eq!(fourth.reset_at_ms, T0 + 1600);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _clock, _store) = test_limiter();

        assert!(limiter.check_rate_limit("a", 1, 1000).await.unwrap().allowed);
        assert!(!limiter.check_rate_limit("a", 1, 1000).await.unwrap().allowed);
        assert!(limiter.check_rate_limit("b", 1, 1000).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_window_key_gets_ttl_with_margin() {
        let (limiter, _clock, store) = test_limiter();

        limiter.check_rate_limit("k", 5, 1000).await.unwrap();

        let ttl = store.ttl("ratelimit:k").unwrap();
        assert!(ttl > std::time::Duration::from_secs(60));
        assert!(ttl <= std::time::Duration::from_secs(61));
    }

    #[tokio::test]
    async fn test_fails_open_when_store_down() {
        let store = Arc::new(FlakyStore::down());
        let limiter = SlidingWindowLimiter::new(store.clone())
            .with_clock(Arc::new(ManualClock::new(T0)));

        for _ in 0..10 {
            let result = limiter.check_rate_limit("k", 5, 1000).await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, 4);
            assert_eq!(result.reset_at_ms, T0 + 1000);
        }

        // Back online: enforcement resumes from an empty window
        store.set_down(false);
        let result = limiter.check_rate_limit("k", 5, 1000).await.unwrap();
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn test_zero_max_requests_rejects_without_store() {
        let limiter = SlidingWindowLimiter::new(Arc::new(FlakyStore::down()));
        let result = limiter.check_rate_limit("k", 0, 1000).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_zero_window_is_config_error() {
        let (limiter, _clock, _store) = test_limiter();
        let err = limiter.check_rate_limit("k", 5, 0).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Config(_)));
    }

    #[tokio::test]
    async fn test_operation_presets() {
        let (limiter, _clock, store) = test_limiter();
        let limiter = limiter.with_presets(RateLimitPresets {
            email_by_recipient: RateLimitRule::new(2, 1000),
            ..RateLimitPresets::default()
        });

        assert!(limiter.check_email_by_recipient("Ann@Example.com").await.unwrap().allowed);
        assert!(limiter.check_email_by_recipient("ann@example.com").await.unwrap().allowed);
        assert!(!limiter.check_email_by_recipient("ann@example.com").await.unwrap().allowed);

        let ai = limiter.check_ai("u1").await.unwrap();
        assert_eq!(ai.remaining, limiter.presets().ai.max_requests - 1);

        let snapshot = store
            .trim_window("ratelimit:email:recipient:ann@example.com", 0)
            .await
            .unwrap();
        assert_eq!(snapshot.count, 2);
    }

    #[tokio::test]
    async fn test_global_email_shared_across_callers() {
        let (limiter, _clock, _store) = test_limiter();
        let limiter = limiter.with_presets(RateLimitPresets {
            email_global: RateLimitRule::new(1, 1000),
            ..RateLimitPresets::default()
        });

        assert!(limiter.check_email_global().await.unwrap().allowed);
        assert!(!limiter.check_email_global().await.unwrap().allowed);
    }

    #[test]
    fn test_entry_members_are_unique() {
        let a = entry_member(T0);
        let b = entry_member(T0);
        assert!(a.starts_with(&format!("{T0}-")));
        assert_eq!(a.len(), T0.to_string().len() + 10);
        assert_ne!(a, b);
    }

    #[test]
    fn test_reset_at_conversion() {
        let result = RateLimitResult {
            allowed: true,
            remaining: 1,
            reset_at_ms: T0,
        };
        assert_eq!(result.reset_at().unwrap().timestamp_millis(), T0);
        assert_eq!(result.retry_after_ms(T0 + 5), 0);
    }
}
