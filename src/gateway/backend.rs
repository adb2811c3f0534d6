use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;

/// Raw string-level access to a volatile key-value store.
///
/// Implementations report failures as they are; classifying them into connection-level and command-level errors is
/// the only policy they are expected to carry. Degradation, timeouts and reconnection are the
/// [`CacheGateway`](super::CacheGateway)'s business.
#[async_trait]
pub trait CacheBackend: Debug + Send + Sync + 'static {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value, replacing any previous value and its TTL.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Delete keys, returning how many of them existed.
    async fn del(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Atomically increment an integer value by one. A missing key counts as zero. An existing TTL is kept.
    async fn incr(&self, key: &str) -> Result<i64, CacheError>;

    /// Atomically subtract `amount` from an integer value and return the result. A missing key counts as zero. The key
    /// is removed in the same step once the result is zero or below; otherwise its TTL is kept.
    async fn decr_by(&self, key: &str, amount: i64) -> Result<i64, CacheError>;

    /// Attach a TTL to an existing key. Returns `false` if there is no such key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Enumerate keys matching a glob pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Drop every key of the database.
    async fn flush(&self) -> Result<(), CacheError>;
}

/// Produces connected backends. The gateway calls it on start-up and whenever it needs to reconnect.
#[async_trait]
pub trait CacheConnector: Send + Sync + 'static {
    /// Human-readable connection target; must not leak credentials.
    fn target(&self) -> String;

    async fn connect(&self) -> Result<Arc<dyn CacheBackend>, CacheError>;
}
