//! Connection guards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::store::{CounterStore, StoreError};

/// Counters a guard holds an increment on.
struct Backing {
    store: Arc<dyn CounterStore>,
    keys: Vec<String>,
    ttl: Duration,
}

/// Permission to hold one long-lived connection open.
///
/// A guard stands for exactly one outstanding increment on each counter it was
/// admitted against. `release` gives the slot back; it is idempotent and safe
/// to call concurrently from several tasks. A guard dropped without release
/// inside a tokio runtime schedules the release on that runtime; outside a
/// runtime the counters are left for their TTL to clean up.
pub struct ConnectionGuard {
    id: Uuid,
    user_id: String,
    company_id: String,
    backing: Option<Backing>,
    released: AtomicBool,
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("company_id", &self.company_id)
            .field("backed", &self.backing.is_some())
            .field("released", &self.is_released())
            .finish()
    }
}

impl ConnectionGuard {
    pub(crate) fn new(
        store: Arc<dyn CounterStore>,
        keys: Vec<String>,
        ttl: Duration,
        user_id: &str,
        company_id: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            company_id: company_id.to_string(),
            backing: Some(Backing { store, keys, ttl }),
            released: AtomicBool::new(false),
        }
    }

    /// A guard issued while the counter store was unavailable. It holds no
    /// increment, so releasing it touches nothing.
    pub(crate) fn unbacked(user_id: &str, company_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            company_id: company_id.to_string(),
            backing: None,
            released: AtomicBool::new(false),
        }
    }

    /// Identifier for correlating log lines about this connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn company_id(&self) -> &str {
        &self.company_id
    }

    /// Whether this guard holds counter increments (false when issued under a
    /// fail-open policy during a store outage).
    pub fn is_backed(&self) -> bool {
        self.backing.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Give the connection slot back.
    ///
    /// Only the first call decrements; later calls return immediately. The
    /// decrement runs as its own task, so it completes even if this future is
    /// cancelled. Store failures are logged, not returned: the counters' TTL
    /// bounds the leak.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            trace!(guard = %self.id, "Connection guard already released");
            return;
        }

        let Some(backing) = &self.backing else {
            return;
        };

        let store = backing.store.clone();
        let keys = backing.keys.clone();
        let ttl = backing.ttl;
        let id = self.id;
        let user_id = self.user_id.clone();
        let company_id = self.company_id.clone();

        let task = async move {
            match decrement_with_floor(store.as_ref(), &keys, ttl).await {
                Ok(()) => debug!(
                    guard = %id,
                    user_id = %user_id,
                    company_id = %company_id,
                    "Released connection"
                ),
                Err(e) => warn!(
                    guard = %id,
                    user_id = %user_id,
                    company_id = %company_id,
                    error = %e,
                    "Failed to release connection, counters will expire via TTL"
                ),
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // Dropping the join handle detaches the task rather than aborting it.
                if let Err(e) = handle.spawn(task).await {
                    warn!(guard = %id, error = %e, "Release task failed");
                }
            }
            Err(_) => task.await,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(Backing { store, keys, ttl }) = self.backing.take() else {
            return;
        };

        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(guard = %id, "Connection guard dropped without release, releasing");
                handle.spawn(async move {
                    if let Err(e) = decrement_with_floor(store.as_ref(), &keys, ttl).await {
                        warn!(guard = %id, error = %e, "Failed to release dropped connection guard");
                    }
                });
            }
            Err(_) => warn!(
                guard = %id,
                user_id = %self.user_id,
                company_id = %self.company_id,
                "Connection guard dropped outside a runtime, counters will expire via TTL"
            ),
        }
    }
}

/// Decrement `keys`, deleting any counter that lands below zero.
///
/// Negative values happen when a slot is released after an administrative
/// reset already zeroed the counter.
pub(crate) async fn decrement_with_floor(
    store: &dyn CounterStore,
    keys: &[String],
    ttl: Duration,
) -> Result<(), StoreError> {
    let values = store.decrement_all(keys, ttl).await?;

    for (key, value) in keys.iter().zip(values) {
        if value < 0 {
            debug!(key = %key, value, "Counter went negative, resetting");
            store.delete(key).await?;
        }
    }
    Ok(())
}
