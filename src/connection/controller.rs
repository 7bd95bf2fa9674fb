//! Connection admission controller.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::guard::{decrement_with_floor, ConnectionGuard};
use crate::error::{AdmissionError, Result};
use crate::store::{CounterStore, StoreError};

/// What `acquire` does when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Refuse the connection and return the store error.
    #[default]
    Closed,
    /// Admit the connection with a guard that holds no counters.
    Open,
}

/// Ceilings and counter settings for connection admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionLimits {
    /// Simultaneous connections allowed per user
    pub max_per_user: u64,
    /// Simultaneous connections allowed per company, across all its users
    pub max_per_company: u64,
    /// TTL refreshed on every counter mutation. Bounds how long a crashed
    /// process can leak a slot; must outlive realistic connection lifetimes.
    pub counter_ttl_secs: u64,
    /// Namespace for counter keys
    pub key_prefix: String,
    /// Behaviour of `acquire` during a store outage
    pub on_store_error: FailurePolicy,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_per_user: 5,
            max_per_company: 100,
            counter_ttl_secs: 3600,
            key_prefix: "sse".to_string(),
            on_store_error: FailurePolicy::Closed,
        }
    }
}

impl ConnectionLimits {
    pub fn validate(&self) -> Result<()> {
        if self.counter_ttl_secs == 0 {
            return Err(AdmissionError::Config(
                "connections.counter_ttl_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn counter_ttl(&self) -> Duration {
        Duration::from_secs(self.counter_ttl_secs)
    }
}

/// Occupancy and ceilings of both dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCounts {
    pub user_connections: u64,
    pub user_limit: u64,
    pub company_connections: u64,
    pub company_limit: u64,
}

impl ConnectionCounts {
    /// Whether the user dimension is over its ceiling.
    pub fn user_exceeded(&self) -> bool {
        self.user_connections > self.user_limit
    }

    /// Whether the company dimension is over its ceiling.
    pub fn company_exceeded(&self) -> bool {
        self.company_connections > self.company_limit
    }
}

/// Rejection carrying the counts observed when the attempt went over a
/// ceiling (before the attempt's own increment was rolled back).
#[derive(Debug, Clone, Error)]
#[error(
    "Connection limit exceeded: user {}/{}, company {}/{}",
    .counts.user_connections,
    .counts.user_limit,
    .counts.company_connections,
    .counts.company_limit
)]
pub struct SseConnectionLimitError {
    pub counts: ConnectionCounts,
}

/// Result of a side-effect free admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCheck {
    /// Whether one more connection would currently be admitted
    pub allowed: bool,
    pub counts: ConnectionCounts,
}

/// Current value and ceiling of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionCount {
    pub current: u64,
    pub limit: u64,
}

/// Snapshot of the dimensions asked for in `get_counts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CountsSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<DimensionCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<DimensionCount>,
}

/// One quota dimension taking part in an admission.
struct Quota {
    key: String,
    limit: u64,
}

/// Bounds simultaneous long-lived connections per user and per company.
///
/// Each dimension is an independent counter in the shared store. An admission
/// increments every dimension in one round trip; if any ends up over its
/// ceiling, all of them are decremented again and the attempt is rejected.
pub struct ConnectionController {
    store: Arc<dyn CounterStore>,
    limits: ConnectionLimits,
}

impl ConnectionController {
    /// Create a controller.
    pub fn new(store: Arc<dyn CounterStore>, limits: ConnectionLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> &ConnectionLimits {
        &self.limits
    }

    /// Admit one connection for `user_id` within `company_id`.
    ///
    /// Returns [`AdmissionError::ConnectionLimit`] if either ceiling would be
    /// exceeded.
    pub async fn acquire(&self, user_id: &str, company_id: &str) -> Result<ConnectionGuard> {
        let quotas = self.quotas(user_id, company_id);
        let keys: Vec<String> = quotas.iter().map(|q| q.key.clone()).collect();
        let ttl = self.limits.counter_ttl();

        let observed = match self.admit(&quotas, &keys, ttl).await {
            Ok(observed) => observed,
            Err(e) => return self.store_failure(user_id, company_id, e),
        };

        if let Some(observed) = observed {
            let counts = self.counts_from(&observed);
            debug!(
                user_id = %user_id,
                company_id = %company_id,
                user_connections = counts.user_connections,
                company_connections = counts.company_connections,
                "Connection limit exceeded"
            );
            return Err(SseConnectionLimitError { counts }.into());
        }

        let guard = ConnectionGuard::new(self.store.clone(), keys, ttl, user_id, company_id);
        debug!(
            guard = %guard.id(),
            user_id = %user_id,
            company_id = %company_id,
            "Connection admitted"
        );
        Ok(guard)
    }

    /// Would one more connection be admitted right now? Reads only.
    pub async fn can_connect(&self, user_id: &str, company_id: &str) -> Result<ConnectionCheck> {
        let quotas = self.quotas(user_id, company_id);
        let keys: Vec<String> = quotas.iter().map(|q| q.key.clone()).collect();

        let current = self.store.get_all(&keys).await?;
        expect_len(&current, keys.len())?;

        let allowed = quotas
            .iter()
            .zip(&current)
            .all(|(quota, &value)| clamp(value) < quota.limit);

        Ok(ConnectionCheck {
            allowed,
            counts: self.counts_from(&current),
        })
    }

    /// Current counters and ceilings for whichever dimensions are given.
    pub async fn get_counts(
        &self,
        user_id: Option<&str>,
        company_id: Option<&str>,
    ) -> Result<CountsSnapshot> {
        let mut keys = Vec::with_capacity(2);
        if let Some(user_id) = user_id {
            keys.push(self.user_key(user_id));
        }
        if let Some(company_id) = company_id {
            keys.push(self.company_key(company_id));
        }
        if keys.is_empty() {
            return Ok(CountsSnapshot::default());
        }

        let values = self.store.get_all(&keys).await?;
        expect_len(&values, keys.len())?;
        let mut values = values.into_iter().map(clamp);

        let user = user_id.and_then(|_| values.next()).map(|current| DimensionCount {
            current,
            limit: self.limits.max_per_user,
        });
        let company = company_id
            .and_then(|_| values.next())
            .map(|current| DimensionCount {
                current,
                limit: self.limits.max_per_company,
            });

        Ok(CountsSnapshot { user, company })
    }

    /// Zero a user's connection counter regardless of outstanding guards.
    pub async fn force_disconnect_user(&self, user_id: &str) -> Result<()> {
        self.store.delete(&self.user_key(user_id)).await?;
        info!(user_id = %user_id, "Reset user connection counter");
        Ok(())
    }

    /// Zero a company's connection counter regardless of outstanding guards.
    pub async fn force_disconnect_company(&self, company_id: &str) -> Result<()> {
        self.store.delete(&self.company_key(company_id)).await?;
        info!(company_id = %company_id, "Reset company connection counter");
        Ok(())
    }

    /// Increment every quota. Returns `None` when admitted, or the
    /// post-increment values when any quota went over (after rolling back).
    async fn admit(
        &self,
        quotas: &[Quota],
        keys: &[String],
        ttl: Duration,
    ) -> std::result::Result<Option<Vec<i64>>, StoreError> {
        let observed = self.store.increment_all(keys, ttl).await?;
        if let Err(e) = expect_len(&observed, keys.len()) {
            self.rollback(keys, ttl).await;
            return Err(e);
        }

        let over = quotas
            .iter()
            .zip(&observed)
            .any(|(quota, &value)| clamp(value) > quota.limit);
        if !over {
            return Ok(None);
        }

        self.rollback(keys, ttl).await;
        Ok(Some(observed))
    }

    async fn rollback(&self, keys: &[String], ttl: Duration) {
        if let Err(e) = decrement_with_floor(self.store.as_ref(), keys, ttl).await {
            warn!(
                keys = ?keys,
                error = %e,
                "Failed to roll back connection counters, they will expire via TTL"
            );
        }
    }

    fn store_failure(
        &self,
        user_id: &str,
        company_id: &str,
        error: StoreError,
    ) -> Result<ConnectionGuard> {
        match self.limits.on_store_error {
            FailurePolicy::Closed => {
                warn!(
                    user_id = %user_id,
                    company_id = %company_id,
                    error = %error,
                    "Counter store unavailable, refusing connection"
                );
                Err(error.into())
            }
            FailurePolicy::Open => {
                warn!(
                    user_id = %user_id,
                    company_id = %company_id,
                    error = %error,
                    "Counter store unavailable, admitting connection untracked"
                );
                Ok(ConnectionGuard::unbacked(user_id, company_id))
            }
        }
    }

    fn quotas(&self, user_id: &str, company_id: &str) -> [Quota; 2] {
        [
            Quota {
                key: self.user_key(user_id),
                limit: self.limits.max_per_user,
            },
            Quota {
                key: self.company_key(company_id),
                limit: self.limits.max_per_company,
            },
        ]
    }

    /// Counts for the `[user, company]` values returned by the store.
    fn counts_from(&self, values: &[i64]) -> ConnectionCounts {
        ConnectionCounts {
            user_connections: values.first().copied().map(clamp).unwrap_or(0),
            user_limit: self.limits.max_per_user,
            company_connections: values.get(1).copied().map(clamp).unwrap_or(0),
            company_limit: self.limits.max_per_company,
        }
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}:user:{}", self.limits.key_prefix, user_id)
    }

    fn company_key(&self, company_id: &str) -> String {
        format!("{}:company:{}", self.limits.key_prefix, company_id)
    }
}

fn clamp(value: i64) -> u64 {
    value.max(0) as u64
}

fn expect_len(values: &[i64], expected: usize) -> std::result::Result<(), StoreError> {
    if values.len() == expected {
        Ok(())
    } else {
        Err(StoreError::Protocol(format!(
            "expected {expected} counter values, got {}",
            values.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FlakyStore;
    use crate::store::InMemoryCounterStore;
    use futures::future::join_all;
    use tokio_test::{assert_err, assert_ok};

    fn limits(max_per_user: u64, max_per_company: u64) -> ConnectionLimits {
        ConnectionLimits {
            max_per_user,
            max_per_company,
            ..ConnectionLimits::default()
        }
    }

    fn controller(max_per_user: u64, max_per_company: u64) -> ConnectionController {
        ConnectionController::new(
            Arc::new(InMemoryCounterStore::new()),
            limits(max_per_user, max_per_company),
        )
    }

    async fn user_count(controller: &ConnectionController, user_id: &str) -> u64 {
        controller
            .get_counts(Some(user_id), None)
            .await
            .unwrap()
            .user
            .unwrap()
            .current
    }

    #[tokio::test]
    async fn test_user_ceiling() {
        let controller = controller(3, 100);

        let mut guards = Vec::new();
        for _ in 0..3 {
            guards.push(assert_ok!(controller.acquire("alice", "acme").await));
        }

        let err = assert_err!(controller.acquire("alice", "acme").await);
        let limit = err.as_connection_limit().expect("limit error");
        assert!(limit.counts.user_connections >= 3);
        assert_eq!(limit.counts.user_limit, 3);
        assert!(limit.counts.user_exceeded());
        assert!(!limit.counts.company_exceeded());

        // The rejected attempt was rolled back
        assert_eq!(user_count(&controller, "alice").await, 3);

        // Releasing one frees exactly one slot
        guards.pop().unwrap().release().await;
        guards.push(assert_ok!(controller.acquire("alice", "acme").await));
        assert_err!(controller.acquire("alice", "acme").await);
    }

    #[tokio::test]
    async fn test_error_reports_pre_rollback_counts() {
        let controller = controller(1, 100);
        let _guard = controller.acquire("alice", "acme").await.unwrap();

        let err = controller.acquire("alice", "acme").await.unwrap_err();
        let counts = err.as_connection_limit().unwrap().counts;
        assert_eq!(counts.user_connections, 2);
        assert_eq!(counts.company_connections, 2);
        assert_eq!(
            err.to_string(),
            "Connection limit exceeded: user 2/1, company 2/100"
        );

        let snapshot = controller.get_counts(Some("alice"), Some("acme")).await.unwrap();
        assert_eq!(snapshot.user.unwrap().current, 1);
        assert_eq!(snapshot.company.unwrap().current, 1);
    }

    #[tokio::test]
    async fn test_company_ceiling_aggregates_users() {
        let controller = controller(3, 5);

        let mut guards = Vec::new();
        for _ in 0..3 {
            guards.push(controller.acquire("alice", "acme").await.unwrap());
        }
        for _ in 0..2 {
            guards.push(controller.acquire("bob", "acme").await.unwrap());
        }

        let err = controller.acquire("bob", "acme").await.unwrap_err();
        let counts = err.as_connection_limit().unwrap().counts;
        assert!(counts.company_exceeded());
        assert!(!counts.user_exceeded());
        assert_eq!(counts.company_connections, 6);

        // Another company is unaffected
        guards.push(controller.acquire("carol", "globex").await.unwrap());

        let snapshot = controller.get_counts(Some("bob"), Some("acme")).await.unwrap();
        assert_eq!(snapshot.user.unwrap().current, 2);
        assert_eq!(snapshot.company.unwrap().current, 5);
    }

    #[tokio::test]
    async fn test_release_twice_frees_one_slot() {
        let controller = controller(3, 100);
        let _a = controller.acquire("alice", "acme").await.unwrap();
        let b = controller.acquire("alice", "acme").await.unwrap();

        b.release().await;
        b.release().await;

        assert_eq!(user_count(&controller, "alice").await, 1);
    }

    #[tokio::test]
    async fn test_can_connect_is_side_effect_free() {
        let controller = controller(2, 100);
        let _guard = controller.acquire("alice", "acme").await.unwrap();
        let before = controller.get_counts(Some("alice"), Some("acme")).await.unwrap();

        for _ in 0..100 {
            let check = controller.can_connect("alice", "acme").await.unwrap();
            assert!(check.allowed);
            assert_eq!(check.counts.user_connections, 1);
        }

        let after = controller.get_counts(Some("alice"), Some("acme")).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_can_connect_at_ceiling() {
        let controller = controller(1, 100);
        let _guard = controller.acquire("alice", "acme").await.unwrap();

        let check = controller.can_connect("alice", "acme").await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.counts.user_connections, 1);
        assert_eq!(check.counts.user_limit, 1);
    }

    #[tokio::test]
    async fn test_force_disconnect_user() {
        let controller = controller(3, 100);

        let mut leaked = Vec::new();
        for _ in 0..3 {
            leaked.push(controller.acquire("alice", "acme").await.unwrap());
        }
        assert_err!(controller.acquire("alice", "acme").await);

        controller.force_disconnect_user("alice").await.unwrap();
        assert_eq!(user_count(&controller, "alice").await, 0);

        let guard = assert_ok!(controller.acquire("alice", "acme").await);

        // Releasing guards issued before the reset never drives the counter
        // below zero.
        for old in &leaked {
            old.release().await;
        }
        assert_eq!(user_count(&controller, "alice").await, 0);
        guard.release().await;
        assert_eq!(user_count(&controller, "alice").await, 0);
    }

    #[tokio::test]
    async fn test_force_disconnect_company() {
        let controller = controller(10, 2);
        let _a = controller.acquire("alice", "acme").await.unwrap();
        let _b = controller.acquire("bob", "acme").await.unwrap();
        assert_err!(controller.acquire("carol", "acme").await);

        controller.force_disconnect_company("acme").await.unwrap();

        let snapshot = controller.get_counts(None, Some("acme")).await.unwrap();
        assert!(snapshot.user.is_none());
        assert_eq!(snapshot.company.unwrap().current, 0);
        assert_ok!(controller.acquire("carol", "acme").await);
    }

    #[tokio::test]
    async fn test_get_counts_without_dimensions() {
        let controller = ConnectionController::new(Arc::new(FlakyStore::down()), limits(1, 1));
        let snapshot = controller.get_counts(None, None).await.unwrap();
        assert_eq!(snapshot, CountsSnapshot::default());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_respects_ceiling() {
        let controller = Arc::new(controller(4, 100));

        let attempts = (0..20).map(|_| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.acquire("alice", "acme").await })
        });
        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 4);
        assert_eq!(user_count(&controller, "alice").await, 4);
    }

    #[tokio::test]
    async fn test_store_down_fails_closed_by_default() {
        let controller = ConnectionController::new(Arc::new(FlakyStore::down()), limits(3, 3));

        let err = controller.acquire("alice", "acme").await.unwrap_err();
        assert!(matches!(err, AdmissionError::Store(StoreError::Unavailable(_))));
        assert!(controller.can_connect("alice", "acme").await.is_err());
    }

    #[tokio::test]
    async fn test_store_down_fail_open_policy() {
        let store = Arc::new(FlakyStore::down());
        let controller = ConnectionController::new(
            store.clone(),
            ConnectionLimits {
                on_store_error: FailurePolicy::Open,
                ..limits(1, 1)
            },
        );

        let guard = controller.acquire("alice", "acme").await.unwrap();
        assert!(!guard.is_backed());

        store.set_down(false);
        guard.release().await;
        assert_eq!(user_count(&controller, "alice").await, 0);
    }

    #[test]
    fn test_counts_serialize_camel_case() {
        let counts = ConnectionCounts {
            user_connections: 3,
            user_limit: 3,
            company_connections: 7,
            company_limit: 50,
        };
        let json = serde_json::to_value(counts).unwrap();
        assert_eq!(json["userConnections"], 3);
        assert_eq!(json["companyLimit"], 50);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let limits = ConnectionLimits {
            counter_ttl_secs: 0,
            ..ConnectionLimits::default()
        };
        assert!(limits.validate().is_err());
    }
}
