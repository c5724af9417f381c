//! Sharding Configuration
//!
//! Every knob the coordination subsystem reads, with defaults suited to a
//! small fleet and environment variable overrides for deployment.

use conductor_core::TOTAL_KEY_SPACE;
use std::time::Duration;

/// Shard coordination configuration
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    // Key-space
    /// Size of the key-space split across instances (env: CONDUCTOR_TOTAL_SIZE)
    pub total_size: u64,

    // Key namespaces
    /// Prefix for membership records (env: CONDUCTOR_INSTANCE_PREFIX)
    pub instance_prefix: String,

    /// Prefix for shard records (env: CONDUCTOR_SHARD_PREFIX)
    pub shard_prefix: String,

    // Membership
    /// TTL for the instance lease in seconds (env: CONDUCTOR_LEASE_TTL)
    pub lease_ttl: i64,

    /// Interval between lease renewals (a third of the TTL)
    pub keepalive_interval: Duration,

    /// Identity written into the membership record (env: CONDUCTOR_ADVERTISE_ADDR)
    pub advertise_addr: String,

    // Control loop timing
    /// Debounce after watch events, and re-claim cadence while shard-less
    /// (env: CONDUCTOR_CLAIM_RETRY_MS)
    pub claim_retry_interval: Duration,

    /// Steady-state reconciliation cadence (env: CONDUCTOR_CHECK_INTERVAL_MS)
    pub check_interval: Duration,

    /// Pause before re-subscribing a closed watch stream
    pub watch_retry_delay: Duration,

    /// Upper bound on lease grant plus membership write
    pub register_timeout: Duration,

    /// Upper bound on release plus unregister during stop
    pub shutdown_timeout: Duration,

    // Etcd connection
    /// Etcd endpoints (env: ETCD_ENDPOINTS, comma-separated)
    pub etcd_endpoints: Vec<String>,

    /// Initial interval for etcd connection retry
    pub etcd_backoff_initial: Duration,

    /// Maximum interval for etcd connection retry
    pub etcd_backoff_max: Duration,

    /// Maximum elapsed time for etcd connection retries
    pub etcd_backoff_max_elapsed: Duration,

    /// Multiplier for etcd backoff
    pub etcd_backoff_multiplier: f64,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        let lease_ttl = 10;

        Self {
            total_size: TOTAL_KEY_SPACE,

            instance_prefix: "/conductor/instances".to_string(),
            shard_prefix: "/conductor/shards".to_string(),

            lease_ttl,
            keepalive_interval: keepalive_for(lease_ttl),
            advertise_addr: "127.0.0.1:8080".to_string(),

            claim_retry_interval: Duration::from_secs(2),
            check_interval: Duration::from_secs(10),
            watch_retry_delay: Duration::from_secs(1),
            register_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(3),

            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            etcd_backoff_initial: Duration::from_secs(1),
            etcd_backoff_max: Duration::from_secs(10),
            etcd_backoff_max_elapsed: Duration::from_secs(60),
            etcd_backoff_multiplier: 2.0,
        }
    }
}

impl ShardingConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(total) = env_parse::<u64>("CONDUCTOR_TOTAL_SIZE") {
            config.total_size = total;
        }

        if let Ok(prefix) = std::env::var("CONDUCTOR_INSTANCE_PREFIX") {
            config.instance_prefix = prefix;
        }

        if let Ok(prefix) = std::env::var("CONDUCTOR_SHARD_PREFIX") {
            config.shard_prefix = prefix;
        }

        if let Some(ttl) = env_parse::<i64>("CONDUCTOR_LEASE_TTL").filter(|ttl| *ttl > 0) {
            config.lease_ttl = ttl;
            config.keepalive_interval = keepalive_for(ttl);
        }

        if let Ok(addr) = std::env::var("CONDUCTOR_ADVERTISE_ADDR") {
            config.advertise_addr = addr;
        }

        if let Some(ms) = env_parse::<u64>("CONDUCTOR_CLAIM_RETRY_MS") {
            config.claim_retry_interval = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("CONDUCTOR_CHECK_INTERVAL_MS") {
            config.check_interval = Duration::from_millis(ms);
        }

        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            config.etcd_endpoints = split_endpoints(&endpoints);
        }

        config
    }

    /// Builder-style override of the lease TTL, keeping the renewal cadence in step.
    pub fn with_lease_ttl(mut self, ttl: i64) -> Self {
        self.lease_ttl = ttl;
        self.keepalive_interval = keepalive_for(ttl);
        self
    }
}

/// Split a comma-separated endpoint list, dropping blanks.
pub fn split_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn keepalive_for(ttl: i64) -> Duration {
    Duration::from_millis((ttl.max(1) as u64 * 1000) / 3)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
