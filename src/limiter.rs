use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    error::{RateLimitError, Result},
    metrics::Metrics,
    store::Store,
    utils::{generate_window_key, SystemTimeSource, TimeSource},
};

/// Default number of admitted requests per window
pub const DEFAULT_LIMIT: u64 = 1000;

/// Default window length, one hour
pub const DEFAULT_WINDOW_SECONDS: u64 = 60 * 60;

/// Construction parameters for a [`RateLimiter`].
///
/// `limit` and `window_seconds` stay signed so that values coming from
/// configuration files can be rejected instead of wrapping.
#[derive(Clone, Default)]
pub struct RateLimiterConfig {
    /// Admitted requests per window. `None` means [`DEFAULT_LIMIT`], `Some(0)`
    /// denies every request.
    pub limit: Option<i64>,
    /// Window length. `None` or `Some(0)` means [`DEFAULT_WINDOW_SECONDS`].
    pub window_seconds: Option<i64>,
    pub store: Option<Arc<dyn Store>>,
}

impl RateLimiterConfig {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store: Some(store),
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn window_seconds(mut self, window_seconds: i64) -> Self {
        self.window_seconds = Some(window_seconds);
        self
    }
}

/// Decision for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub limit: u64,
    pub current_counter: u64,
    pub remaining_counter: u64,
    /// Seconds until the window resets
    pub ttl_seconds: i64,
    /// Unix seconds
    pub reset_timestamp: i64,
    pub is_limit_reached: bool,
}

impl Context {
    fn new(limit: u64, current_counter: u64, ttl_seconds: i64, now: i64) -> Self {
        Self {
            limit,
            current_counter,
            remaining_counter: limit.saturating_sub(current_counter),
            ttl_seconds,
            reset_timestamp: now.saturating_add(ttl_seconds),
            is_limit_reached: current_counter > limit,
        }
    }
}

/// Fixed-window rate limiter.
///
/// Windows are aligned to the Unix epoch, so every process sharing a store
/// agrees on where a window starts.
pub struct RateLimiter {
    limit: u64,
    window_seconds: u64,
    store: Arc<dyn Store>,
    time_source: Arc<dyn TimeSource>,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("window_seconds", &self.window_seconds)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Validate `config` and build a limiter reading the system clock
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        let limit = match config.limit {
            None => DEFAULT_LIMIT,
            Some(limit) if limit < 0 => {
                return Err(RateLimitError::Config(format!(
                    "negative limit is not allowed: {}",
                    limit
                )))
            }
            Some(limit) => limit as u64,
        };

        let window_seconds = match config.window_seconds {
            None | Some(0) => DEFAULT_WINDOW_SECONDS,
            Some(window) if window < 0 => {
                return Err(RateLimitError::Config(format!(
                    "negative window_seconds is not allowed: {}",
                    window
                )))
            }
            Some(window) => window as u64,
        };

        let store = config
            .store
            .ok_or_else(|| RateLimitError::Config("a store is required".to_string()))?;

        Ok(Self {
            limit,
            window_seconds,
            store,
            time_source: Arc::new(SystemTimeSource),
            metrics: None,
        })
    }

    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Count one request for `key` and decide whether it is over the limit.
    ///
    /// Store failures are returned unchanged; there is no retry and no
    /// partial decision.
    pub async fn get(&self, key: &str) -> Result<Context> {
        let _timer = self.metrics.as_ref().map(|m| m.start_request_timer());

        let now = self.time_source.unix_now();
        let window_key = generate_window_key(key, self.window_seconds, now);

        let result = match self
            .store
            .increment(&window_key, self.limit, self.window_seconds)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!("Store increment failed for {}: {}", window_key, e);
                if let Some(metrics) = &self.metrics {
                    metrics.record_error();
                }
                return Err(e);
            }
        };

        let context = Context::new(self.limit, result.counter, result.ttl_seconds, now);

        if let Some(metrics) = &self.metrics {
            if context.is_limit_reached {
                metrics.record_limited();
            } else {
                metrics.record_admitted();
            }
        }
        debug!(
            "{} at {}/{} (reached: {})",
            window_key, context.current_counter, self.limit, context.is_limit_reached
        );

        Ok(context)
    }

    /// Health check for the backing store
    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}
