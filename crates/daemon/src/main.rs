use std::sync::Arc;
use std::time::Duration;

use courier_common::config::DispatchConfig;
use courier_common::redis_pool::create_redis_pool;
use courier_dispatch::worker::WorkerPool;
use courier_fanout::registry::SubscriptionFanout;
use courier_queue::redis_store::RedisQueueStore;

/// How often the idle-subscription sweep runs, relative to the idle window.
const SWEEP_DIVISOR: u32 = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_daemon=info,courier_dispatch=info,courier_queue=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier dispatch daemon starting...");

    // Load configuration
    let config = DispatchConfig::from_env()?;

    // Connect to Redis
    let redis = create_redis_pool(&config.redis_url).await?;

    // Wire the store, the fanout and the dispatch pool
    let store = Arc::new(RedisQueueStore::with_prefix(
        redis,
        config.queue_key_prefix.clone(),
    ));
    let fanout = Arc::new(SubscriptionFanout::with_send_timeout(config.send_timeout()));
    let pool = WorkerPool::start(store, Arc::clone(&fanout), &config);

    // Sweep subscriptions that have gone quiet
    let idle_window = config.subscription_idle();
    let sweep_interval = idle_window
        .checked_div(SWEEP_DIVISOR)
        .unwrap_or(idle_window)
        .max(Duration::from_secs(1));
    let sweeper_fanout = Arc::clone(&fanout);
    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweeper_fanout.evict_idle(idle_window).await;
        }
    });

    // Run until Ctrl+C, then drain in-flight claims
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    sweeper.abort();
    pool.shutdown().await;

    tracing::info!("Courier dispatch daemon stopped.");
    Ok(())
}
