//! In-process counter store.
//!
//! Mirrors the semantics of the networked store for a single process: tests,
//! local development, and deployments that run one instance. Keys expire lazily:
//! an expired key is removed the next time it is touched, and a window that
//! trims to empty is removed outright.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::{CounterStore, StoreError, WindowSnapshot};

#[derive(Debug)]
enum Value {
    Counter(i64),
    Window(BTreeSet<(i64, String)>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A counter store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    slots: DashMap<String, Slot>,
    /// Serialises multi-key calls so each one is applied as a unit, like a
    /// MULTI/EXEC pipeline.
    pipeline: Mutex<()>,
}

impl InMemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|s| !s.is_expired(now)).count()
    }

    /// Remaining TTL of a key, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.slots
            .get(key)
            .filter(|s| !s.is_expired(now))
            .and_then(|s| s.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Drop `key` if its TTL has passed.
    fn evict_expired(&self, key: &str, now: Instant) {
        self.slots.remove_if(key, |_, slot| slot.is_expired(now));
    }

    fn add_to_counter(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut slot = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Slot {
                        value: Value::Counter(0),
                        expires_at: None,
                    });
                }
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => vacant.insert(Slot {
                value: Value::Counter(0),
                expires_at: None,
            }),
        };

        let value = match &mut slot.value {
            Value::Counter(n) => {
                *n += delta;
                *n
            }
            Value::Window(_) => {
                return Err(StoreError::Protocol(format!(
                    "key {key} holds a window, not a counter"
                )))
            }
        };
        slot.expires_at = Some(now + ttl);
        Ok(value)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn trim_window(
        &self,
        key: &str,
        window_start_ms: i64,
    ) -> Result<WindowSnapshot, StoreError> {
        let _pipeline = self.pipeline.lock();
        let now = Instant::now();
        self.evict_expired(key, now);

        let snapshot = {
            let Some(mut slot) = self.slots.get_mut(key) else {
                return Ok(WindowSnapshot::default());
            };

            match &mut slot.value {
                Value::Window(entries) => {
                    // Entries are ordered by score, so everything before the
                    // first in-window entry is expired.
                    let keep = entries.split_off(&(window_start_ms, String::new()));
                    let purged = entries.len();
                    *entries = keep;

                    trace!(key = %key, purged, remaining = entries.len(), "Trimmed window");

                    WindowSnapshot {
                        count: entries.len() as u64,
                        oldest_ms: entries.first().map(|(score, _)| *score),
                    }
                }
                Value::Counter(_) => {
                    return Err(StoreError::Protocol(format!(
                        "key {key} holds a counter, not a window"
                    )))
                }
            }
        };

        if snapshot.count == 0 {
            self.slots.remove(key);
        }
        Ok(snapshot)
    }

    async fn add_entry(
        &self,
        key: &str,
        score_ms: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let _pipeline = self.pipeline.lock();
        let now = Instant::now();

        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Window(BTreeSet::new()),
            expires_at: None,
        });
        if slot.is_expired(now) {
            slot.value = Value::Window(BTreeSet::new());
        }

        match &mut slot.value {
            Value::Window(entries) => {
                entries.retain(|(_, m)| m != member);
                entries.insert((score_ms, member.to_string()));
            }
            Value::Counter(_) => {
                return Err(StoreError::Protocol(format!(
                    "key {key} holds a counter, not a window"
                )))
            }
        }
        slot.expires_at = Some(now + ttl);
        Ok(())
    }

    async fn increment_all(&self, keys: &[String], ttl: Duration) -> Result<Vec<i64>, StoreError> {
        let _pipeline = self.pipeline.lock();
        keys.iter()
            .map(|key| self.add_to_counter(key, 1, ttl))
            .collect()
    }

    async fn decrement_all(&self, keys: &[String], ttl: Duration) -> Result<Vec<i64>, StoreError> {
        let _pipeline = self.pipeline.lock();
        keys.iter()
            .map(|key| self.add_to_counter(key, -1, ttl))
            .collect()
    }

    async fn get_all(&self, keys: &[String]) -> Result<Vec<i64>, StoreError> {
        let _pipeline = self.pipeline.lock();
        let now = Instant::now();

        keys.iter()
            .map(|key| {
                self.evict_expired(key, now);
                match self.slots.get(key) {
                    Some(slot) => match slot.value {
                        Value::Counter(n) => Ok(n),
                        Value::Window(_) => Err(StoreError::Protocol(format!(
                            "key {key} holds a window, not a counter"
                        ))),
                    },
                    None => Ok(0),
                }
            })
            .collect()
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _pipeline = self.pipeline.lock();
        self.slots.remove(key);
        Ok(())
    }
}
