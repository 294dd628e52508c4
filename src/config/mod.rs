/// Configuration management for the contentway core
///
/// Handles server configuration, database location, execution engine tuning and
/// webhook delivery policy. Every value can be overridden through `CONTENTWAY_*`
/// environment variables for container deployments.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Workflow execution engine configuration
    pub engine: EngineConfig,
    /// Webhook delivery configuration
    pub webhooks: WebhookConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding `contentway.db` (default: "data")
    pub data_dir: String,
}

/// Execution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Max number of step continuations executing at the same time
    pub queue_concurrency: usize,
}

/// Webhook delivery policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Consecutive failures that open a webhook's circuit breaker
    pub circuit_breaker_threshold: u32,
    /// How long an open breaker short-circuits deliveries
    pub circuit_breaker_timeout: Duration,
    /// Consecutive half-open successes needed to close the breaker again
    pub half_open_success_threshold: u32,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Backoff unit; attempt `n` waits `base * 2^n`
    pub retry_backoff_base: Duration,
    /// Whether `batchable` triggers are accumulated into batches
    pub batching_enabled: bool,
    /// Events per batch before an immediate flush
    pub batch_size: usize,
    /// Max age of a batch before the sweeper flushes it
    pub batch_timeout: Duration,
    /// Per-request HTTP timeout
    pub delivery_timeout: Duration,
    /// Max deliveries in flight
    pub delivery_concurrency: usize,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("CONTENTWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("CONTENTWAY_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("CONTENTWAY_DATA_DIR")
                    .unwrap_or_else(|_| "data".to_string()),
            },
            engine: EngineConfig {
                queue_concurrency: env_or("CONTENTWAY_ENGINE_CONCURRENCY", 8),
            },
            webhooks: WebhookConfig::default(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_threshold: env_or("CONTENTWAY_WEBHOOK_BREAKER_THRESHOLD", 5),
            circuit_breaker_timeout: Duration::from_secs(env_or(
                "CONTENTWAY_WEBHOOK_BREAKER_TIMEOUT_SECS",
                60,
            )),
            half_open_success_threshold: env_or("CONTENTWAY_WEBHOOK_HALF_OPEN_SUCCESSES", 3),
            max_retries: env_or("CONTENTWAY_WEBHOOK_MAX_RETRIES", 3),
            retry_backoff_base: Duration::from_millis(env_or(
                "CONTENTWAY_WEBHOOK_RETRY_BASE_MS",
                1000,
            )),
            batching_enabled: env_or("CONTENTWAY_WEBHOOK_BATCHING", true),
            batch_size: env_or("CONTENTWAY_WEBHOOK_BATCH_SIZE", 10),
            batch_timeout: Duration::from_millis(env_or(
                "CONTENTWAY_WEBHOOK_BATCH_TIMEOUT_MS",
                5000,
            )),
            delivery_timeout: Duration::from_secs(env_or(
                "CONTENTWAY_WEBHOOK_TIMEOUT_SECS",
                30,
            )),
            delivery_concurrency: env_or("CONTENTWAY_WEBHOOK_CONCURRENCY", 10),
        }
    }
}

/// Read and parse an environment variable, falling back on absence or parse failure
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
