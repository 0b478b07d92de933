//! Environment configuration.
//!
//! No CLI flags; everything comes from the environment, with the defaults the
//! compose files assume.

use std::env;
use std::time::Duration;

const DEFAULT_BROKER_URL: &str = "redis://localhost:6379";
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_LEASE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8090";

#[derive(Debug, Clone)]
pub struct Config {
    /// Message broker connection URL.
    pub broker_url: String,
    /// Saga log DSN. `None` selects the in-memory store (dev only).
    pub saga_log_dsn: Option<String>,
    /// Retry cap per log entry; entries beyond it stay in `Error`.
    pub max_attempts: u32,
    /// Broker lease: how long a consumer blocks per receive before looping.
    pub lease_timeout: Duration,
    /// Bind address of the health endpoint.
    pub health_addr: String,
}

impl Config {
    pub fn from_env() -> Self {
        let broker_url =
            env::var("BROKER_URL").unwrap_or_else(|_| DEFAULT_BROKER_URL.to_string());

        let saga_log_dsn = env::var("SAGA_LOG_DSN")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok();

        let max_attempts = env::var("MAX_RETRY_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        let lease_timeout_ms = env::var("LEASE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LEASE_TIMEOUT_MS);

        let health_addr =
            env::var("HEALTH_ADDR").unwrap_or_else(|_| DEFAULT_HEALTH_ADDR.to_string());

        Self {
            broker_url,
            saga_log_dsn,
            max_attempts,
            lease_timeout: Duration::from_millis(lease_timeout_ms),
            health_addr,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            saga_log_dsn: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease_timeout: Duration::from_millis(DEFAULT_LEASE_TIMEOUT_MS),
            health_addr: DEFAULT_HEALTH_ADDR.to_string(),
        }
    }
}
