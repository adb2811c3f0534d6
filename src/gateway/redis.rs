//! Redis backend over a multiplexed async connection. Reconnection is left to the gateway supervisor.
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use redis::AsyncIter;
use redis::Client;
use redis::Script;
use tracing::debug;

use super::backend::CacheBackend;
use super::backend::CacheConnector;
use crate::error::CacheError;

// DECRBY and the removal of an exhausted key must not be split by a concurrent INCR.
const DECR_BY_SCRIPT: &str = r"
local left = redis.call('DECRBY', KEYS[1], ARGV[1])
if left <= 0 then
    redis.call('DEL', KEYS[1])
end
return left
";

pub struct RedisBackend {
    conn: MultiplexedConnection,
}

impl Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RedisBackend {{ ... }}")
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match ttl {
            // SETEX refuses zero; a sub-second TTL is rounded up.
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        Ok(conn.del(keys.to_vec()).await?)
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1i64).await?)
    }

    async fn decr_by(&self, key: &str, amount: i64) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        Ok(Script::new(DECR_BY_SCRIPT)
            .key(key)
            .arg(amount)
            .invoke_async(&mut conn)
            .await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.expire(key, ttl.as_secs().max(1) as i64).await?)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let mut iter: AsyncIter<String> = conn.scan_match(pattern).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn flush(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }
}

pub struct RedisConnector {
    client: Client,
    target: String,
}

impl RedisConnector {
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(|err| CacheError::Command(format!("invalid Redis URL: {err}")))?;
        let info = client.get_connection_info();
        let target = format!("redis://{}/{}", info.addr, info.redis.db);
        Ok(Self { client, target })
    }
}

#[async_trait]
impl CacheConnector for RedisConnector {
    fn target(&self) -> String {
        self.target.clone()
    }

    async fn connect(&self) -> Result<Arc<dyn CacheBackend>, CacheError> {
        debug!("Connecting to {}", self.target);
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(Arc::new(RedisBackend { conn }))
    }
}
