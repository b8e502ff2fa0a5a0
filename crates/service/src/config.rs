//! Environment-driven configuration.
//!
//! Every knob has a documented default; unset or malformed variables fall
//! back with a warning rather than aborting startup.

use std::time::Duration;

use circulation_breaker::BreakerConfig;
use circulation_lock::LockConfig;
use circulation_registry::HealthCheckSpec;

/// Default detail-read cache TTL.
const DEFAULT_DETAIL_TTL: Duration = Duration::from_secs(600);

/// Default listing cache TTL. Also the staleness bound if a prefix
/// invalidation is missed while the cache is degraded.
const DEFAULT_LIST_TTL: Duration = Duration::from_secs(300);

/// Default overall deadline for one locked mutation.
const DEFAULT_OPERATION_DEADLINE: Duration = Duration::from_secs(10);

const DEFAULT_EVENT_TOPIC: &str = "library-events";
const DEFAULT_WORK_QUEUE: &str = "book-notifications";
const DEFAULT_CONSUMER_GROUP: &str = "book-service";

/// Cache TTLs per key family.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub detail: Duration,
    pub list: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            detail: DEFAULT_DETAIL_TTL,
            list: DEFAULT_LIST_TTL,
        }
    }
}

/// Event channel/topic names.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub event_topic: String,
    pub work_queue: String,
    pub consumer_group: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            event_topic: DEFAULT_EVENT_TOPIC.to_string(),
            work_queue: DEFAULT_WORK_QUEUE.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
        }
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_ttl: CacheTtls,
    pub lock: LockConfig,
    pub breaker: BreakerConfig,
    pub health: HealthCheckSpec,
    pub channels: ChannelConfig,
    pub operation_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_ttl: CacheTtls::default(),
            lock: LockConfig::default(),
            breaker: BreakerConfig::default(),
            health: HealthCheckSpec::default(),
            channels: ChannelConfig::default(),
            operation_deadline: DEFAULT_OPERATION_DEADLINE,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            cache_ttl: CacheTtls {
                detail: env_secs("CACHE_DETAIL_TTL_SECS", DEFAULT_DETAIL_TTL),
                list: env_secs("CACHE_LIST_TTL_SECS", DEFAULT_LIST_TTL),
            },
            lock: LockConfig {
                lease: env_ms("LOCK_LEASE_MS", LockConfig::default().lease),
                retry_count: env_u32("LOCK_RETRY_COUNT", LockConfig::default().retry_count),
                ..LockConfig::default()
            },
            breaker: BreakerConfig {
                call_timeout: env_ms("BREAKER_TIMEOUT_MS", defaults.call_timeout),
                failure_rate: env_f64("BREAKER_FAILURE_RATE", defaults.failure_rate),
                reset_timeout: env_ms("BREAKER_RESET_MS", defaults.reset_timeout),
                ..defaults
            },
            health: HealthCheckSpec {
                interval: env_secs("HEALTH_INTERVAL_SECS", HealthCheckSpec::default().interval),
                deregister_after: env_secs(
                    "HEALTH_GRACE_SECS",
                    HealthCheckSpec::default().deregister_after,
                ),
                ..HealthCheckSpec::default()
            },
            channels: ChannelConfig {
                event_topic: env_string("EVENT_TOPIC", DEFAULT_EVENT_TOPIC),
                work_queue: env_string("WORK_QUEUE", DEFAULT_WORK_QUEUE),
                consumer_group: env_string("CONSUMER_GROUP", DEFAULT_CONSUMER_GROUP),
            },
            operation_deadline: env_ms("OPERATION_DEADLINE_MS", DEFAULT_OPERATION_DEADLINE),
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_secs(name: &str, default: Duration) -> Duration {
    parse_env(name)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_ms(name: &str, default: Duration) -> Duration {
    parse_env(name)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    parse_env(name).unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    parse_env(name).unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring malformed configuration value");
            None
        }
    }
}
