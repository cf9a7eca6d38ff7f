//! Typed configuration singleton, loaded once from the environment.

use std::env;
use std::sync::OnceLock;

use crate::errors::ConfigError;

static CONFIG: OnceLock<Config> = OnceLock::new();

const ENV_PREFIX: &str = "ODIN_WEBSOCKET_";

// --- CONFIG AGGREGATOR ---

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub connection: ConnectionConfig,
    pub broadcast: BroadcastConfig,
    pub rate_limiter: RateLimiterConfig,
    pub resource_guard: ResourceGuardConfig,
    pub dedup: DedupConfig,
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Cached singleton, panicking on invalid configuration. Kept for
    /// convenience; `main` itself calls `try_load` directly so a bad
    /// environment surfaces as a logged `ConfigError` and a clean exit
    /// rather than a panic (section 7's error taxonomy: config errors are
    /// one of the few allowed to reach the process boundary).
    pub fn global() -> &'static Config {
        CONFIG.get_or_init(|| {
            Self::try_load().unwrap_or_else(|err| panic!("invalid configuration: {err}"))
        })
    }

    /// Fallible load: every sub-config's `load()` can fail on a malformed
    /// environment value, and the first failure short-circuits the rest.
    pub fn try_load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Ok(Self {
            server: ServerConfig::load()?,
            registry: RegistryConfig::load()?,
            connection: ConnectionConfig::load()?,
            broadcast: BroadcastConfig::load()?,
            rate_limiter: RateLimiterConfig::load()?,
            resource_guard: ResourceGuardConfig::load()?,
            dedup: DedupConfig::load()?,
            upstream: UpstreamConfig::load()?,
        })
    }
}

// SERVER
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub ws_port: u16,
    pub http_port: u16,
    pub ws_path: String,
    pub log_level: String,
    pub shutdown_deadline_ms: u64,
}

impl ServerConfig {
    fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            host: get_env("SERVER_HOST", "0.0.0.0")?,
            ws_port: get_env("SERVER_PORT", "7654")?,
            http_port: get_env("HTTP_PORT", "8080")?,
            ws_path: get_env_string("WS_PATH", "/ws"),
            log_level: get_env_string("LOG_LEVEL", "info"),
            shutdown_deadline_ms: get_env("SHUTDOWN_DEADLINE_MS", "2000")?,
        })
    }
}

// REGISTRY
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub shard_count: usize,
    pub max_connections: usize,
}

impl RegistryConfig {
    fn load() -> Result<Self, ConfigError> {
        let shard_count: usize = get_env("SHARD_COUNT", "64")?;
        if !shard_count.is_power_of_two() {
            return Err(ConfigError::Invalid {
                key: format!("{ENV_PREFIX}SHARD_COUNT"),
                reason: format!("must be a power of two, got {shard_count}"),
            });
        }
        Ok(Self {
            shard_count,
            max_connections: get_env("MAX_CONNECTIONS", "100000")?,
        })
    }
}

// CONNECTION
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub send_channel_size: usize,
    pub seen_nonces_capacity: usize,
    pub write_deadline_ms: u64,
    pub ping_interval_ms: u64,
    pub missed_pongs_limit: u32,
    pub close_drain_deadline_ms: u64,
    pub slow_client_strikes: u32,
    pub slow_client_window_ms: u64,
    pub malformed_frame_limit: u32,
    pub malformed_frame_window_ms: u64,
}

impl ConnectionConfig {
    fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            send_channel_size: get_env("SEND_CHANNEL_SIZE", "256")?,
            seen_nonces_capacity: get_env("SEEN_NONCES_CAPACITY", "1024")?,
            write_deadline_ms: get_env("WRITE_DEADLINE_MS", "5000")?,
            ping_interval_ms: get_env("PING_INTERVAL_MS", "30000")?,
            missed_pongs_limit: get_env("MISSED_PONGS_LIMIT", "2")?,
            close_drain_deadline_ms: get_env("CLOSE_DRAIN_DEADLINE_MS", "2000")?,
            slow_client_strikes: get_env("SLOW_CLIENT_STRIKES", "3")?,
            slow_client_window_ms: get_env("SLOW_CLIENT_WINDOW_MS", "5000")?,
            malformed_frame_limit: get_env("MALFORMED_FRAME_LIMIT", "10")?,
            malformed_frame_window_ms: get_env("MALFORMED_FRAME_WINDOW_MS", "5000")?,
        })
    }
}

// BROADCAST
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub broadcast_queue_size: usize,
    pub broadcast_workers: usize,
}

impl BroadcastConfig {
    fn load() -> Result<Self, ConfigError> {
        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .max(2);
        Ok(Self {
            broadcast_queue_size: get_env("BROADCAST_QUEUE_SIZE", "1024")?,
            broadcast_workers: get_env("BROADCAST_WORKERS", &default_workers.to_string())?,
        })
    }
}

// RATE LIMITER
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_inbound_rate: u32,
    pub max_broadcast_rate: u32,
}

impl RateLimiterConfig {
    fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            max_inbound_rate: get_env("MAX_INBOUND_RATE", "5000")?,
            max_broadcast_rate: get_env("MAX_BROADCAST_RATE", "5000")?,
        })
    }
}

// RESOURCE GUARD
#[derive(Debug, Clone)]
pub struct ResourceGuardConfig {
    pub cpu_pause_threshold: f64,
    pub cpu_reject_threshold: f64,
    pub metrics_interval_ms: u64,
    pub max_tasks: usize,
    /// Container/host memory ceiling the guard treats 95% of as REJECT
    /// (section 4.5). Defaults to 4 GiB, the conservative single-node
    /// allocation this hub assumes when no cgroup limit is configured.
    pub max_memory_bytes: u64,
}

impl ResourceGuardConfig {
    fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            cpu_pause_threshold: get_env("CPU_PAUSE_THRESHOLD", "0.80")?,
            cpu_reject_threshold: get_env("CPU_REJECT_THRESHOLD", "0.95")?,
            metrics_interval_ms: get_env("METRICS_INTERVAL_MS", "1000")?,
            max_tasks: get_env("MAX_TASKS", "200000")?,
            max_memory_bytes: get_env("MAX_MEMORY_BYTES", "4294967296")?,
        })
    }
}

// DEDUP
#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub dedup_window_ms: u64,
    pub dedup_capacity: usize,
}

impl DedupConfig {
    fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            dedup_window_ms: get_env("DEDUP_WINDOW_MS", "60000")?,
            dedup_capacity: get_env("DEDUP_CAPACITY", "100000")?,
        })
    }
}

// UPSTREAM
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl UpstreamConfig {
    fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            backoff_base_ms: get_env("UPSTREAM_BACKOFF_BASE_MS", "250")?,
            backoff_cap_ms: get_env("UPSTREAM_BACKOFF_CAP_MS", "30000")?,
        })
    }
}

// --- PRIVATE HELPERS ---

fn get_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T, ConfigError> {
    let full_key = format!("{ENV_PREFIX}{key}");
    let raw = env::var(&full_key).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|_| ConfigError::Invalid {
        key: full_key,
        reason: format!("{raw:?} is not a valid value"),
    })
}

fn get_env_string(key: &str, default: &str) -> String {
    let full_key = format!("{ENV_PREFIX}{key}");
    env::var(&full_key).unwrap_or_else(|_| default.to_string())
}

/// Hand-built `Config` values for tests, bypassing `Config::global()` and
/// the environment entirely (section 6.1: "tests construct a `Config`
/// directly ... so suites can run with small, fast-converging values").
/// Not `cfg(test)`-gated: the `tests/` integration suite is a separate
/// crate and needs this too.
pub mod test_support {
    use super::*;

    pub fn small_config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                ws_port: 0,
                http_port: 0,
                ws_path: "/ws".to_string(),
                log_level: "debug".to_string(),
                shutdown_deadline_ms: 200,
            },
            registry: RegistryConfig {
                shard_count: 4,
                max_connections: 1000,
            },
            connection: ConnectionConfig {
                send_channel_size: 8,
                seen_nonces_capacity: 16,
                write_deadline_ms: 500,
                ping_interval_ms: 200,
                missed_pongs_limit: 2,
                close_drain_deadline_ms: 100,
                slow_client_strikes: 3,
                slow_client_window_ms: 5000,
                malformed_frame_limit: 10,
                malformed_frame_window_ms: 5000,
            },
            broadcast: BroadcastConfig {
                broadcast_queue_size: 64,
                broadcast_workers: 2,
            },
            rate_limiter: RateLimiterConfig {
                max_inbound_rate: 10_000,
                max_broadcast_rate: 10_000,
            },
            resource_guard: ResourceGuardConfig {
                cpu_pause_threshold: 0.80,
                cpu_reject_threshold: 0.95,
                metrics_interval_ms: 50,
                max_tasks: 200_000,
                max_memory_bytes: 4_294_967_296,
            },
            dedup: DedupConfig {
                dedup_window_ms: 200,
                dedup_capacity: 1000,
            },
            upstream: UpstreamConfig {
                backoff_base_ms: 10,
                backoff_cap_ms: 100,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_env_falls_back_to_default_when_unset() {
        let key = "ODIN_WEBSOCKET_TEST_UNSET_VALUE_XYZ";
        std::env::remove_var(key);
        let value: u32 = get_env("TEST_UNSET_VALUE_XYZ", "42").unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn get_env_rejects_unparseable_value() {
        let key = "ODIN_WEBSOCKET_TEST_BAD_VALUE_XYZ";
        std::env::set_var(key, "not-a-number");
        let result: Result<u32, ConfigError> = get_env("TEST_BAD_VALUE_XYZ", "1");
        assert!(result.is_err());
        std::env::remove_var(key);
    }
}
