// Checks that the configured store is reachable and counts as expected.
// Run this with: cargo run --bin debug_startup
// Settings come from CONFIG_PATH (YAML) and RATELIMIT_* environment variables.

use anyhow::Result;
use std::{sync::Arc, time::{Duration, Instant}};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use window_ratelimit::{metrics::Metrics, Settings};

const CHECK_REQUESTS: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "window_ratelimit=debug,debug_startup=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting store check...");
    let start_time = Instant::now();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let settings = Settings::load(config_path.as_deref())?;
    info!("Using settings: {:?}", settings);

    let metrics = Arc::new(Metrics::new()?);
    let limiter = settings.build_limiter(Some(metrics))?;

    let result = tokio::time::timeout(Duration::from_secs(10), limiter.health_check()).await;
    match result {
        Ok(Ok(())) => info!("Health check passed in {:?}", start_time.elapsed()),
        Ok(Err(e)) => {
            error!("Health check failed: {}", e);
            return Err(e.into());
        }
        Err(_) => {
            error!("Health check timed out after 10 seconds");
            return Err(anyhow::anyhow!("Store health check timeout"));
        }
    }

    let check_key =
        std::env::var("CHECK_KEY").unwrap_or_else(|_| "debug-startup-check".to_string());
    for _ in 0..CHECK_REQUESTS {
        let context = limiter.get(&check_key).await?;
        info!(
            "{}: counter={} remaining={} ttl={}s reset_at={} limited={}",
            check_key,
            context.current_counter,
            context.remaining_counter,
            context.ttl_seconds,
            context.reset_timestamp,
            context.is_limit_reached
        );
    }

    info!("Startup check completed successfully in {:?}", start_time.elapsed());
    Ok(())
}
