//! Fixed-window rate limiter
//!
//! Counts operations per caller key within windows aligned to the Unix epoch
//! and reports whether a key exceeded its quota. Counting is delegated to a
//! [`Store`]: [`MemoryStore`] for a single process, [`RedisStore`] for
//! replicas sharing one Redis server.

pub mod config;
pub mod error;
pub mod limiter;
pub mod memory;
pub mod metrics;
pub mod redis;
pub mod store;
pub mod utils;

// Re-export main types
pub use crate::config::Settings;
pub use error::{RateLimitError, Result};
pub use limiter::{Context, RateLimiter, RateLimiterConfig};
pub use memory::MemoryStore;
pub use crate::redis::{RedisConfig, RedisStore};
pub use store::{IncrementResult, Store};
