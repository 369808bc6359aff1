//! Process-wide configuration (design §6.4, §9 "frozen at startup").
//!
//! Loaded once from environment variables and wrapped in an `Arc` by the
//! caller, mirroring `bpmn-lite-server/src/main.rs`'s `--database-url` /
//! `DATABASE_URL` resolution, generalized to every option the design names.

use std::env;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub script_tasks_enabled: bool,
    pub timer_poll_interval_ms: u64,
    pub timer_lease_ttl_ms: u64,
    pub handler_http_default_timeout_ms: u64,
    pub handler_http_max_retries: u32,
    pub variable_max_bytes: usize,
    pub max_concurrent_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            script_tasks_enabled: false,
            timer_poll_interval_ms: 1000,
            timer_lease_ttl_ms: 60_000,
            handler_http_default_timeout_ms: 30_000,
            handler_http_max_retries: 0,
            variable_max_bytes: 1024 * 1024,
            max_concurrent_workers: num_cpus(),
        }
    }
}

impl EngineConfig {
    /// Build configuration from environment variables, falling back to the
    /// defaults above for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            script_tasks_enabled: env_bool("SCRIPT_TASKS_ENABLED", defaults.script_tasks_enabled),
            timer_poll_interval_ms: env_u64(
                "TIMER_POLL_INTERVAL_MS",
                defaults.timer_poll_interval_ms,
            ),
            timer_lease_ttl_ms: env_u64("TIMER_LEASE_TTL_MS", defaults.timer_lease_ttl_ms),
            handler_http_default_timeout_ms: env_u64(
                "HANDLER_HTTP_DEFAULT_TIMEOUT_MS",
                defaults.handler_http_default_timeout_ms,
            ),
            handler_http_max_retries: env_u64(
                "HANDLER_HTTP_MAX_RETRIES",
                defaults.handler_http_max_retries as u64,
            ) as u32,
            variable_max_bytes: env_u64("VARIABLE_MAX_BYTES", defaults.variable_max_bytes as u64)
                as usize,
            max_concurrent_workers: env_u64(
                "MAX_CONCURRENT_WORKERS",
                defaults.max_concurrent_workers as u64,
            ) as usize,
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
