//! In-process volatile cache built on [moka](https://crates.io/crates/moka).
//!
//! Mirrors the subset of Redis semantics the pipeline relies on: string values, atomic `INCR` that keeps the key's
//! deadline, `EXPIRE`, and glob key enumeration. Every entry carries its own absolute deadline which is turned into
//! moka's per-entry expiration.
//!
//! The store can be switched offline to simulate an unreachable server: operations and connection attempts fail with
//! connection-level errors until it is back online. The connector can additionally be told to refuse connections.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use glob::Pattern;
use moka::future::Cache;
use moka::ops::compute::CompResult;
use moka::ops::compute::Op;
use moka::Expiry;
use tracing::debug;

use super::backend::CacheBackend;
use super::backend::CacheConnector;
use crate::error::CacheError;

#[derive(Clone, Debug)]
struct Slot {
    data:     String,
    deadline: Option<Instant>,
}

impl Slot {
    fn new(data: String, ttl: Option<Duration>) -> Self {
        Self {
            data,
            deadline: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn remaining(&self, at: Instant) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(at))
    }
}

struct SlotExpiry;

impl Expiry<String, Slot> for SlotExpiry {
    fn expire_after_create(&self, _key: &String, value: &Slot, created_at: Instant) -> Option<Duration> {
        value.remaining(created_at)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Slot,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining(updated_at)
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    cache:   Cache<String, Slot>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache:   Cache::builder()
                .name("wb-viewcount-memory")
                .max_capacity(max_capacity)
                .expire_after(SlotExpiry)
                .build(),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate a server going away (`true`) or coming back (`false`).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), CacheError> {
        if self.is_offline() {
            Err(CacheError::Connection("in-memory store is offline".into()))
        }
        else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

#[async_trait]
impl CacheBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check_online()?;
        Ok(self.cache.get(key).await.map(|slot| slot.data))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check_online()?;
        self.cache.insert(key.to_string(), Slot::new(value, ttl)).await;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.check_online()?;
        let mut removed = 0;
        for key in keys {
            if self.cache.remove(key).await.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.check_online()?;

        let result = self
            .cache
            .entry(key.to_string())
            .and_try_compute_with(|entry| async move {
                let (current, deadline) = match entry {
                    Some(entry) => {
                        let slot = entry.into_value();
                        let current = slot
                            .data
                            .parse::<i64>()
                            .map_err(|_| CacheError::Command(format!("value of '{key}' is not an integer")))?;
                        (current, slot.deadline)
                    }
                    None => (0, None),
                };

                let next = current
                    .checked_add(1)
                    .ok_or_else(|| CacheError::Command(format!("increment of '{key}' would overflow")))?;

                Ok::<_, CacheError>(Op::Put(Slot {
                    data: next.to_string(),
                    deadline,
                }))
            })
            .await?;

        match result {
            CompResult::Inserted(entry) | CompResult::ReplacedWith(entry) | CompResult::Unchanged(entry) => entry
                .into_value()
                .data
                .parse::<i64>()
                .map_err(|_| CacheError::Command(format!("value of '{key}' is not an integer"))),
            CompResult::Removed(_) | CompResult::StillNone(_) => {
                Err(CacheError::Command(format!("increment of '{key}' produced no value")))
            }
        }
    }

    async fn decr_by(&self, key: &str, amount: i64) -> Result<i64, CacheError> {
        self.check_online()?;

        let mut remaining = 0i64;
        let out = &mut remaining;
        self.cache
            .entry(key.to_string())
            .and_try_compute_with(|entry| async move {
                let (current, deadline) = match entry {
                    Some(entry) => {
                        let slot = entry.into_value();
                        let current = slot
                            .data
                            .parse::<i64>()
                            .map_err(|_| CacheError::Command(format!("value of '{key}' is not an integer")))?;
                        (current, slot.deadline)
                    }
                    None => (0, None),
                };

                let next = current
                    .checked_sub(amount)
                    .ok_or_else(|| CacheError::Command(format!("decrement of '{key}' would overflow")))?;
                *out = next;

                Ok::<_, CacheError>(if next <= 0 {
                    Op::Remove
                }
                else {
                    Op::Put(Slot {
                        data: next.to_string(),
                        deadline,
                    })
                })
            })
            .await?;

        Ok(remaining)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.check_online()?;

        let result = self
            .cache
            .entry(key.to_string())
            .and_compute_with(|entry| async move {
                match entry {
                    Some(entry) => {
                        let slot = entry.into_value();
                        Op::Put(Slot::new(slot.data, Some(ttl)))
                    }
                    None => Op::Nop,
                }
            })
            .await;

        Ok(matches!(result, CompResult::ReplacedWith(_)))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.check_online()?;
        let pattern =
            Pattern::new(pattern).map_err(|err| CacheError::Command(format!("bad key pattern '{pattern}': {err}")))?;

        let now = Instant::now();
        Ok(self
            .cache
            .iter()
            .filter(|(_, slot)| slot.deadline.is_none_or(|deadline| deadline > now))
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key.as_ref().clone())
            .collect())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.check_online()?;
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }
}

/// Connector handing out one shared [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnector {
    store:    Arc<MemoryStore>,
    refuse:   AtomicBool,
    attempts: AtomicU32,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            refuse: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }

    /// Make subsequent connection attempts fail even while the store itself is online.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connection attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheConnector for MemoryConnector {
    fn target(&self) -> String {
        "memory://".to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn CacheBackend>, CacheError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("memory connector: attempt #{attempt}");

        if self.refuse.load(Ordering::SeqCst) || self.store.is_offline() {
            return Err(CacheError::Connection("connection refused".into()));
        }
        Ok(self.store())
    }
}
