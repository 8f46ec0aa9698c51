use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use crate::{
    error::{RateLimitError, Result},
    metrics::Metrics,
    store::{IncrementResult, Store},
};

/// TTL reply for a key that exists but has no expiry
const TTL_NO_EXPIRY: i64 = -1;

/// Redis client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    /// Maximum number of idle connections kept for reuse
    pub max_idle: usize,
    /// Maximum number of connections handed out at once, 0 for no limit
    pub max_active: usize,
    /// Idle connections older than this are closed instead of reused
    #[serde(with = "seconds")]
    pub idle_timeout: Duration,
    /// Upper bound on waiting for a free slot and on dialing a connection
    #[serde(with = "seconds")]
    pub connection_timeout: Duration,
    /// Timeout for PING health checks
    #[serde(with = "seconds")]
    pub command_timeout: Duration,
    /// PING connections taken from the idle list before use
    pub test_on_borrow: bool,
    /// Prepended to every store key as `prefix:key` when non-empty
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            max_idle: 100,
            max_active: 500,
            idle_timeout: Duration::from_secs(240),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            test_on_borrow: true,
            key_prefix: String::new(),
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

struct IdleConnection {
    connection: MultiplexedConnection,
    returned_at: Instant,
}

/// Bounded pool of Redis connections.
///
/// At most `max_active` connections are checked out at a time; further
/// borrowers wait for a slot up to `connection_timeout`. Returned connections
/// are kept for reuse up to `max_idle`.
pub struct RedisClientPool {
    client: redis::Client,
    idle: Mutex<VecDeque<IdleConnection>>,
    permits: Semaphore,
    config: RedisConfig,
}

impl RedisClientPool {
    /// Create a pool. No connection is dialed until the first borrow.
    pub fn new(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis pool for {}", config.url());

        let client = redis::Client::open(config.url()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::Redis(e)
        })?;

        let max_active = if config.max_active == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.max_active
        };

        Ok(Self {
            client,
            idle: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(max_active),
            config,
        })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Number of idle connections currently held
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Borrow a connection, waiting for a free slot if `max_active` are out
    pub async fn get(&self) -> Result<PooledConnection<'_>> {
        let permit = tokio::time::timeout(self.config.connection_timeout, self.permits.acquire())
            .await
            .map_err(|_| {
                RateLimitError::Store(format!(
                    "Timed out after {}s waiting for a Redis connection",
                    self.config.connection_timeout.as_secs()
                ))
            })?
            .map_err(|_| RateLimitError::Store("Redis pool is closed".to_string()))?;

        while let Some(mut connection) = self.take_idle() {
            if !self.config.test_on_borrow || self.ping(&mut connection).await.is_ok() {
                return Ok(PooledConnection {
                    connection: Some(connection),
                    pool: self,
                    _permit: permit,
                });
            }
            debug!("Discarding idle Redis connection that failed PING");
        }

        let connection = self.dial().await?;
        Ok(PooledConnection {
            connection: Some(connection),
            pool: self,
            _permit: permit,
        })
    }

    /// Check that a connection can be established and answers PING
    pub async fn health_check(&self) -> Result<()> {
        let mut connection = self.get().await?;
        let result = self.ping(&mut connection).await;
        if result.is_err() {
            connection.discard();
        }
        result
    }

    fn take_idle(&self) -> Option<MultiplexedConnection> {
        let mut idle = self.idle.lock();
        while let Some(entry) = idle.pop_front() {
            if entry.returned_at.elapsed() <= self.config.idle_timeout {
                return Some(entry.connection);
            }
            // Older entries sit at the front, dropping closes them
        }
        None
    }

    fn put_back(&self, connection: MultiplexedConnection) {
        let mut idle = self.idle.lock();
        idle.retain(|entry| entry.returned_at.elapsed() <= self.config.idle_timeout);
        if idle.len() < self.config.max_idle {
            idle.push_back(IdleConnection {
                connection,
                returned_at: Instant::now(),
            });
        }
    }

    async fn dial(&self) -> Result<MultiplexedConnection> {
        match tokio::time::timeout(
            self.config.connection_timeout,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => {
                warn!("Failed to connect to Redis at {}: {}", self.config.url(), e);
                Err(RateLimitError::Redis(e))
            }
            Err(_) => {
                warn!(
                    "Timeout while connecting to Redis ({}s)",
                    self.config.connection_timeout.as_secs()
                );
                Err(RateLimitError::Store(
                    "Timeout while connecting to Redis".to_string(),
                ))
            }
        }
    }

    async fn ping(&self, connection: &mut MultiplexedConnection) -> Result<()> {
        match tokio::time::timeout(
            self.config.command_timeout,
            redis::cmd("PING").query_async::<_, ()>(connection),
        )
        .await
        {
            Ok(result) => result.map_err(RateLimitError::Redis),
            Err(_) => Err(RateLimitError::Store("Redis PING timed out".to_string())),
        }
    }
}

/// A connection checked out of a [`RedisClientPool`]. It goes back to the
/// idle list on drop unless [`discard`](PooledConnection::discard)ed.
pub struct PooledConnection<'a> {
    connection: Option<MultiplexedConnection>,
    pool: &'a RedisClientPool,
    _permit: SemaphorePermit<'a>,
}

impl PooledConnection<'_> {
    /// Close the connection instead of returning it to the pool
    pub fn discard(mut self) {
        self.connection = None;
    }
}

impl Deref for PooledConnection<'_> {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        // Only `discard` and `drop` take the connection, both consume self
        self.connection.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.put_back(connection);
        }
    }
}

/// Store backed by a Redis server shared between processes.
///
/// Increments run as `MULTI; INCR; TTL; EXEC`, so the counter and its TTL are
/// always read together. A key created by that transaction has no expiry yet
/// and is given one with a follow-up `EXPIRE`.
#[derive(Clone)]
pub struct RedisStore {
    pool: Arc<RedisClientPool>,
    metrics: Option<Arc<Metrics>>,
}

impl RedisStore {
    pub fn new(config: RedisConfig) -> Result<Self> {
        Ok(Self::from_pool(Arc::new(RedisClientPool::new(config)?)))
    }

    pub fn from_pool(pool: Arc<RedisClientPool>) -> Self {
        Self {
            pool,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn pool(&self) -> &Arc<RedisClientPool> {
        &self.pool
    }

    fn store_key(&self, key: &str) -> String {
        let prefix = &self.pool.config().key_prefix;
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", prefix, key)
        }
    }

    fn record(&self, operation: &str, started: Instant, result: &Result<impl Sized>) {
        if let Some(metrics) = &self.metrics {
            let outcome = if result.is_ok() { "success" } else { "error" };
            metrics.record_store_operation("redis", operation, outcome);
            metrics.record_store_operation_duration(
                "redis",
                operation,
                started.elapsed().as_secs_f64(),
            );
        }
    }

    async fn incr_with_ttl(&self, key: &str) -> Result<(i64, i64)> {
        let started = Instant::now();
        let mut connection = self.pool.get().await?;

        let reply = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("TTL")
            .arg(key)
            .query_async::<_, redis::Value>(&mut *connection)
            .await;

        let result = match reply {
            Ok(value) => extract_count_and_ttl(value),
            Err(e) => {
                connection.discard();
                Err(RateLimitError::Redis(e))
            }
        };
        self.record("incr", started, &result);
        result
    }

    async fn set_expiration(&self, key: &str, window_seconds: u64) -> Result<()> {
        let started = Instant::now();
        let mut connection = self.pool.get().await?;

        let reply = redis::cmd("EXPIRE")
            .arg(key)
            .arg(window_seconds)
            .query_async::<_, i64>(&mut *connection)
            .await;

        let result = match reply {
            Ok(_) => Ok(()),
            Err(e) => {
                connection.discard();
                Err(RateLimitError::Redis(e))
            }
        };
        self.record("expire", started, &result);
        result
    }
}

/// Unpack the `EXEC` reply of `INCR` followed by `TTL`
fn extract_count_and_ttl(value: redis::Value) -> Result<(i64, i64)> {
    match value {
        redis::Value::Bulk(values) if values.len() == 2 => match (&values[0], &values[1]) {
            (redis::Value::Int(count), redis::Value::Int(ttl)) => Ok((*count, *ttl)),
            _ => Err(RateLimitError::Redis(redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "Expected integer responses from INCR and TTL",
            )))),
        },
        redis::Value::Nil => Err(RateLimitError::Store(
            "Redis transaction was aborted".to_string(),
        )),
        _ => Err(RateLimitError::Redis(redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "Unexpected transaction response",
        )))),
    }
}

/// Turn a transaction reply into the result to report, and whether the key
/// still needs an `EXPIRE` before that result may be returned
fn reconcile_increment(
    key: &str,
    count: i64,
    ttl: i64,
    window_seconds: u64,
) -> Result<(IncrementResult, bool)> {
    let counter = u64::try_from(count).map_err(|_| {
        RateLimitError::Store(format!("Redis returned a negative counter for {}", key))
    })?;

    if ttl == TTL_NO_EXPIRY {
        let ttl_seconds = i64::try_from(window_seconds).unwrap_or(i64::MAX);
        return Ok((IncrementResult { counter, ttl_seconds }, true));
    }

    Ok((
        IncrementResult {
            counter,
            ttl_seconds: ttl,
        },
        false,
    ))
}

#[async_trait]
impl Store for RedisStore {
    async fn increment(
        &self,
        key: &str,
        _limit: u64,
        window_seconds: u64,
    ) -> Result<IncrementResult> {
        let key = self.store_key(key);
        let (count, ttl) = self.incr_with_ttl(&key).await?;

        let (result, needs_expiry) = reconcile_increment(&key, count, ttl, window_seconds)?;
        if needs_expiry {
            debug!("Setting expiry of {}s on new key {}", window_seconds, key);
            self.set_expiration(&key, window_seconds).await?;
            if let Some(metrics) = &self.metrics {
                metrics.record_expiry_reconciliation();
            }
        }
        Ok(result)
    }

    async fn health_check(&self) -> Result<()> {
        let started = Instant::now();
        let result = self.pool.health_check().await;
        self.record("ping", started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;

    #[test]
    fn test_redis_config_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.url(), "redis://127.0.0.1:6379");
        assert_eq!(config.max_idle, 100);
        assert_eq!(config.max_active, 500);
        assert_eq!(config.idle_timeout, Duration::from_secs(240));
        assert!(config.test_on_borrow);
        assert!(config.key_prefix.is_empty());
    }

    #[test]
    fn test_redis_config_from_yaml() {
        let yaml = r#"
host: redis.internal
port: 6380
max_active: 50
idle_timeout: 30
"#;
        let config: RedisConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.url(), "redis://redis.internal:6380");
        assert_eq!(config.max_active, 50);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        // Unspecified fields keep their defaults
        assert_eq!(config.max_idle, 100);
    }

    #[test]
    fn test_extract_count_and_ttl() {
        let reply = Value::Bulk(vec![Value::Int(3), Value::Int(42)]);
        assert_eq!(extract_count_and_ttl(reply).unwrap(), (3, 42));

        let fresh = Value::Bulk(vec![Value::Int(1), Value::Int(TTL_NO_EXPIRY)]);
        assert_eq!(extract_count_and_ttl(fresh).unwrap(), (1, -1));
    }

    #[test]
    fn test_extract_rejects_malformed_replies() {
        let short = Value::Bulk(vec![Value::Int(1)]);
        assert!(extract_count_and_ttl(short).is_err());

        let wrong_type = Value::Bulk(vec![Value::Status("OK".to_string()), Value::Int(5)]);
        assert!(extract_count_and_ttl(wrong_type).is_err());

        let aborted = extract_count_and_ttl(Value::Nil).unwrap_err();
        assert!(aborted.is_store_error());
    }

    #[test]
    fn test_new_key_needs_expiry() {
        let (result, needs_expiry) = reconcile_increment("k:1", 1, TTL_NO_EXPIRY, 60).unwrap();
        assert!(needs_expiry);
        assert_eq!(result.counter, 1);
        assert_eq!(result.ttl_seconds, 60);
    }

    #[test]
    fn test_key_with_ttl_is_reported_as_is() {
        let (result, needs_expiry) = reconcile_increment("k:1", 4, 17, 60).unwrap();
        assert!(!needs_expiry);
        assert_eq!(result.counter, 4);
        assert_eq!(result.ttl_seconds, 17);
    }

    #[test]
    fn test_reconcile_clamps_huge_window() {
        let (result, needs_expiry) =
            reconcile_increment("k:1", 1, TTL_NO_EXPIRY, u64::MAX).unwrap();
        assert!(needs_expiry);
        assert_eq!(result.ttl_seconds, i64::MAX);
    }

    #[test]
    fn test_negative_counter_is_a_store_error() {
        let err = reconcile_increment("k:1", -3, 10, 60).unwrap_err();
        assert!(err.is_store_error());
    }

    #[test]
    fn test_store_key_prefix() {
        let store = RedisStore::new(RedisConfig {
            key_prefix: "api".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(store.store_key("1.2.3.4:10"), "api:1.2.3.4:10");

        let bare = RedisStore::new(RedisConfig::default()).unwrap();
        assert_eq!(bare.store_key("1.2.3.4:10"), "1.2.3.4:10");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        // Nothing listens on port 1
        let store = RedisStore::new(RedisConfig {
            port: 1,
            connection_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();

        let err = store.increment("k:0", 10, 60).await.unwrap_err();
        assert!(err.is_store_error());
        assert_eq!(store.pool().idle_count(), 0);
    }
}
