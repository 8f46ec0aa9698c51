use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::{
    error::Result,
    limiter::{RateLimiter, RateLimiterConfig},
    memory::MemoryStore,
    metrics::Metrics,
    redis::{RedisConfig, RedisStore},
    store::Store,
};

/// Prefix of environment variables overriding file settings,
/// e.g. `RATELIMIT_LIMITER__LIMIT=100`
pub const ENV_PREFIX: &str = "RATELIMIT";

/// Top-level settings for building a rate limiter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub limiter: LimiterSettings,
    pub store: StoreSettings,
}

/// Quota settings; absent values fall back to the limiter defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterSettings {
    pub limit: Option<i64>,
    pub window_seconds: Option<i64>,
}

/// Which backend to count in
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreSettings {
    #[default]
    Memory,
    Redis(RedisConfig),
}

impl Settings {
    /// Load settings from an optional YAML file, overridden by environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!("Loading settings from: {}", path);
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Construct the configured store
    pub fn build_store(&self, metrics: Option<Arc<Metrics>>) -> Result<Arc<dyn Store>> {
        let store: Arc<dyn Store> = match &self.store {
            StoreSettings::Memory => {
                info!("Using in-process store");
                let store = MemoryStore::new();
                match metrics {
                    Some(metrics) => Arc::new(store.with_metrics(metrics)),
                    None => Arc::new(store),
                }
            }
            StoreSettings::Redis(config) => {
                info!("Using Redis store at {}", config.url());
                let store = RedisStore::new(config.clone())?;
                match metrics {
                    Some(metrics) => Arc::new(store.with_metrics(metrics)),
                    None => Arc::new(store),
                }
            }
        };
        Ok(store)
    }

    /// Construct a validated limiter over the configured store
    pub fn build_limiter(&self, metrics: Option<Arc<Metrics>>) -> Result<RateLimiter> {
        let store = self.build_store(metrics.clone())?;
        let limiter = RateLimiter::new(RateLimiterConfig {
            limit: self.limiter.limit,
            window_seconds: self.limiter.window_seconds,
            store: Some(store),
        })?;
        Ok(match metrics {
            Some(metrics) => limiter.with_metrics(metrics),
            None => limiter,
        })
    }
}

/// Load settings from a YAML string
pub fn load_settings_from_yaml(yaml: &str) -> Result<Settings> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Load settings from a YAML file
pub fn load_settings_from_file(path: &str) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    load_settings_from_yaml(&content)
}
