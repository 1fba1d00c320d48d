use std::time::Duration;

use serde::Deserialize;

/// Default dead-letter threshold: an event is retried until its attempt
/// count reaches this value, then parked for inspection.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default visibility lease for a claimed queue entry, in seconds.
pub const DEFAULT_LEASE_SECS: u64 = 30;

/// Default number of dispatch workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default idle-poll backoff bounds, in milliseconds.
pub const DEFAULT_POLL_BACKOFF_MIN_MS: u64 = 100;
pub const DEFAULT_POLL_BACKOFF_MAX_MS: u64 = 5000;

/// Default number of enqueue attempts a producer makes before giving up.
pub const DEFAULT_PUBLISH_RETRY_BUDGET: u32 = 3;

/// Default per-connection push timeout, in milliseconds.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5000;

/// Default idle window after which a subscription is evicted, in seconds.
pub const DEFAULT_SUBSCRIPTION_IDLE_SECS: u64 = 300;

/// Global dispatch configuration loaded from environment variables.
///
/// Built once at startup and passed into the composition root; components
/// receive the values they need and never read the environment themselves.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Redis connection string for the queue store
    pub redis_url: String,

    /// Queues the dispatch pool consumes, in claim order
    pub queue_names: Vec<String>,

    /// Namespace prefix for all queue keys in Redis
    pub queue_key_prefix: String,

    /// Number of dispatch workers in the pool
    pub worker_count: usize,

    /// Attempt count at which an event is dead-lettered instead of retried
    pub max_attempts: u32,

    /// Visibility lease granted per claim, in seconds
    pub lease_secs: u64,

    /// Lower bound of the idle-poll backoff, in milliseconds
    pub poll_backoff_min_ms: u64,

    /// Upper bound of the idle-poll backoff, in milliseconds
    pub poll_backoff_max_ms: u64,

    /// Enqueue attempts a producer makes before reporting failure
    pub publish_retry_budget: u32,

    /// Per-connection push timeout, in milliseconds
    pub send_timeout_ms: u64,

    /// Idle window after which a subscription is evicted, in seconds
    pub subscription_idle_secs: u64,
}

impl DispatchConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            queue_names: parse_queue_names(
                &std::env::var("QUEUE_NAMES").unwrap_or_else(|_| "notifications".to_string()),
            ),
            queue_key_prefix: std::env::var("QUEUE_KEY_PREFIX")
                .unwrap_or_else(|_| "courier".to_string()),
            worker_count: std::env::var("WORKER_COUNT")
                .unwrap_or_else(|_| DEFAULT_WORKER_COUNT.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("WORKER_COUNT must be a valid usize"))?,
            max_attempts: std::env::var("MAX_ATTEMPTS")
                .unwrap_or_else(|_| DEFAULT_MAX_ATTEMPTS.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("MAX_ATTEMPTS must be a valid u32"))?,
            lease_secs: std::env::var("LEASE_SECS")
                .unwrap_or_else(|_| DEFAULT_LEASE_SECS.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("LEASE_SECS must be a valid u64"))?,
            poll_backoff_min_ms: std::env::var("POLL_BACKOFF_MIN_MS")
                .unwrap_or_else(|_| DEFAULT_POLL_BACKOFF_MIN_MS.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("POLL_BACKOFF_MIN_MS must be a valid u64"))?,
            poll_backoff_max_ms: std::env::var("POLL_BACKOFF_MAX_MS")
                .unwrap_or_else(|_| DEFAULT_POLL_BACKOFF_MAX_MS.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("POLL_BACKOFF_MAX_MS must be a valid u64"))?,
            publish_retry_budget: std::env::var("PUBLISH_RETRY_BUDGET")
                .unwrap_or_else(|_| DEFAULT_PUBLISH_RETRY_BUDGET.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PUBLISH_RETRY_BUDGET must be a valid u32"))?,
            send_timeout_ms: std::env::var("SEND_TIMEOUT_MS")
                .unwrap_or_else(|_| DEFAULT_SEND_TIMEOUT_MS.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SEND_TIMEOUT_MS must be a valid u64"))?,
            subscription_idle_secs: std::env::var("SUBSCRIPTION_IDLE_SECS")
                .unwrap_or_else(|_| DEFAULT_SUBSCRIPTION_IDLE_SECS.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SUBSCRIPTION_IDLE_SECS must be a valid u64"))?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.queue_names.is_empty() {
            anyhow::bail!("QUEUE_NAMES must name at least one queue");
        }
        if self.worker_count == 0 {
            anyhow::bail!("WORKER_COUNT must be at least 1");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.poll_backoff_min_ms > self.poll_backoff_max_ms {
            anyhow::bail!("POLL_BACKOFF_MIN_MS must not exceed POLL_BACKOFF_MAX_MS");
        }
        Ok(())
    }

    /// Visibility lease granted per claim.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Per-connection push timeout.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Idle window after which a subscription is evicted.
    pub fn subscription_idle(&self) -> Duration {
        Duration::from_secs(self.subscription_idle_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_names: vec!["notifications".to_string()],
            queue_key_prefix: "courier".to_string(),
            worker_count: DEFAULT_WORKER_COUNT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease_secs: DEFAULT_LEASE_SECS,
            poll_backoff_min_ms: DEFAULT_POLL_BACKOFF_MIN_MS,
            poll_backoff_max_ms: DEFAULT_POLL_BACKOFF_MAX_MS,
            publish_retry_budget: DEFAULT_PUBLISH_RETRY_BUDGET,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            subscription_idle_secs: DEFAULT_SUBSCRIPTION_IDLE_SECS,
        }
    }
}

/// Split a comma-separated queue list, dropping empty segments.
fn parse_queue_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
