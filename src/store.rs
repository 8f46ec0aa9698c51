use async_trait::async_trait;

use crate::error::Result;

/// Outcome of a single atomic increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementResult {
    /// Counter value after this increment
    pub counter: u64,
    /// Seconds until the entry expires. May be zero or negative for an
    /// entry that is about to be reset.
    pub ttl_seconds: i64,
}

/// Counter storage backing a rate limiter.
///
/// Implementations must apply every increment atomically: concurrent callers
/// incrementing the same key observe each counter value exactly once. The
/// first increment of a key starts its expiry clock at `window_seconds`.
/// Exceeding `limit` is not an error; backends may only use it as a hint.
#[async_trait]
pub trait Store: Send + Sync {
    /// Increment the counter for `key` and report it along with its TTL
    async fn increment(&self, key: &str, limit: u64, window_seconds: u64)
        -> Result<IncrementResult>;

    /// Health check for the backend
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
